//! Port descriptors and board identification.
//!
//! Discovery tools report ports as an address plus a protocol plus free-form
//! identification properties (USB VID/PID and friends). Identification
//! matches those properties against the board definitions of installed
//! platform releases.

use crate::fqbn::Fqbn;
use crate::package_manager::PackageManager;
use crate::packages::Board;
use std::collections::BTreeMap;

/// A port as reported by a discovery tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// e.g. `/dev/ttyACM0` or a network address.
    pub address: String,
    /// e.g. `serial` or `network`.
    pub protocol: String,
    /// Identification properties, lowercase keys.
    pub properties: BTreeMap<String, String>,
}

/// A port appearing or disappearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Add(PortDescriptor),
    Remove(PortDescriptor),
}

/// A board matched against a port's identification properties.
#[derive(Debug, Clone)]
pub struct IdentifiedBoard {
    pub fqbn: Fqbn,
    pub board_name: String,
}

impl PackageManager {
    /// Boards of installed platform releases whose identification
    /// properties match the port. Multiple matches are possible when
    /// distinct boards share a USB identity.
    pub fn identify_board(&self, port: &PortDescriptor) -> Vec<IdentifiedBoard> {
        let mut matches = Vec::new();
        for platform in self.packages.platforms() {
            let Some(release) =
                self.get_installed_platform_release(&platform.package, &platform.architecture)
            else {
                continue;
            };
            for (board_id, board) in &release.boards {
                if board_matches_port(board, port) {
                    matches.push(IdentifiedBoard {
                        fqbn: Fqbn {
                            package: platform.package.clone(),
                            architecture: platform.architecture.clone(),
                            board_id: board_id.clone(),
                            config_options: Vec::new(),
                        },
                        board_name: board.name.clone(),
                    });
                }
            }
        }
        matches
    }
}

/// A board matches when, for some identification group, every board-side
/// property equals the port's property of the same name, case-insensitively.
/// Groups are the unsuffixed `vid`/`pid` pair and each `vid.N`/`pid.N` pair.
fn board_matches_port(board: &Board, port: &PortDescriptor) -> bool {
    let suffixes: Vec<String> = std::iter::once(String::new())
        .chain((0..).map(|i| format!(".{i}")).take_while(|s| {
            board.properties.contains_key(&format!("vid{s}"))
                || board.properties.contains_key(&format!("pid{s}"))
        }))
        .collect();

    for suffix in suffixes {
        let vid = board.properties.get(&format!("vid{suffix}"));
        let pid = board.properties.get(&format!("pid{suffix}"));
        let (Some(vid), Some(pid)) = (vid, pid) else {
            continue;
        };
        let port_vid = port.properties.get("vid");
        let port_pid = port.properties.get("pid");
        let vid_ok = port_vid.is_some_and(|v| v.eq_ignore_ascii_case(vid));
        let pid_ok = port_pid.is_some_and(|p| p.eq_ignore_ascii_case(pid));
        if vid_ok && pid_ok {
            return true;
        }
    }
    false
}
