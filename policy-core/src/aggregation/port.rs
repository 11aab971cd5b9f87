use std::collections::BTreeSet;

use policy_model::PortRule;

/// Deduplicates and merges port/protocol rules across otherwise-identical
/// peers. Adjacent numerical ports are not range-collapsed, for
/// policy-engine compatibility.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortMerger;

impl PortMerger {
    pub fn new() -> Self {
        Self
    }

    /// Deduplicates `ports` and returns them ordered ascending by
    /// protocol, then ascending by port.
    pub fn merge(&self, ports: impl IntoIterator<Item = PortRule>) -> Vec<PortRule> {
        let unique: BTreeSet<PortRule> = ports.into_iter().collect();
        unique.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_model::Protocol;

    #[test]
    fn dedupes_and_sorts_ascending_by_protocol_then_port() {
        let merger = PortMerger::new();
        let merged = merger.merge(vec![
            PortRule { protocol: Protocol::Udp, port: 53 },
            PortRule { protocol: Protocol::Tcp, port: 443 },
            PortRule { protocol: Protocol::Tcp, port: 80 },
            PortRule { protocol: Protocol::Tcp, port: 80 },
        ]);
        assert_eq!(
            merged,
            vec![
                PortRule { protocol: Protocol::Tcp, port: 80 },
                PortRule { protocol: Protocol::Tcp, port: 443 },
                PortRule { protocol: Protocol::Udp, port: 53 },
            ]
        );
    }

    #[test]
    fn does_not_range_collapse_adjacent_ports() {
        let merger = PortMerger::new();
        let merged = merger.merge(vec![
            PortRule { protocol: Protocol::Tcp, port: 8000 },
            PortRule { protocol: Protocol::Tcp, port: 8001 },
            PortRule { protocol: Protocol::Tcp, port: 8002 },
        ]);
        assert_eq!(merged.len(), 3);
    }
}
