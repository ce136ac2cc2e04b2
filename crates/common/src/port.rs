//! Port identity resolver
//!
//! Derives a stable logical identifier from a device's physical bus
//! path (its position on the USB hub tree), independent of which device
//! node the OS hands out on a given insertion.
//!
//! A bus path ends in the hub/port hierarchy segment plus an interface
//! suffix, e.g. `.../usb2/2-1/2-1.2/2-1.2.2/2-1.2.2:1.0`. The port id
//! is that last segment with the `:interface` suffix stripped; the port
//! name is the id with dots flattened to underscores so it can be used
//! as a directory name.

/// Canonical port id for a bus path: the last path segment without the
/// interface suffix. Stripping is a no-op when no suffix is present.
pub fn port_id(bus_path: &str) -> String {
    let segment = bus_path.rsplit('/').next().unwrap_or(bus_path);
    match segment.split_once(':') {
        Some((id, _interface)) => id.to_string(),
        None => segment.to_string(),
    }
}

/// Human-readable port name: the port id with `.` separators normalized
/// to `_` (e.g. `2-1.2.2.4` -> `2-1_2_2_4`).
pub fn port_name(bus_path: &str) -> String {
    port_id(bus_path).replace('.', "_")
}

/// Nested hub-level view of a port id, outermost hub first.
///
/// Purely diagnostic; the stable identity is the flat id string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTree {
    /// Hub/port token at this level.
    pub level: String,
    /// Next level down the hub chain, if any.
    pub child: Option<Box<PortTree>>,
}

impl PortTree {
    /// Build the tree from a port id's dot-separated level sequence.
    /// Returns `None` for an empty id.
    pub fn from_id(id: &str) -> Option<Self> {
        let mut levels = id.split('.').filter(|s| !s.is_empty()).rev();
        let innermost = levels.next()?;
        let mut tree = PortTree {
            level: innermost.to_string(),
            child: None,
        };
        for level in levels {
            tree = PortTree {
                level: level.to_string(),
                child: Some(Box::new(tree)),
            };
        }
        Some(tree)
    }

    /// Depth of the hub chain.
    pub fn depth(&self) -> usize {
        1 + self.child.as_ref().map_or(0, |c| c.depth())
    }
}

impl std::fmt::Display for PortTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut node = Some(self);
        let mut indent = 0;
        while let Some(current) = node {
            writeln!(f, "{:indent$}{}", "", current.level, indent = indent)?;
            node = current.child.as_deref();
            indent += 2;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_id_strips_interface_suffix() {
        let path = "/devices/pci0000:00/0000:00:1d.0/usb2/2-1/2-1.2/2-1.2.2.4/2-1.2.2.4:1.0";
        assert_eq!(port_id(path), "2-1.2.2.4");
    }

    #[test]
    fn test_port_name_normalizes_separators() {
        let path = ".../2-1.2.2.4:1.0";
        assert_eq!(port_name(path), "2-1_2_2_4");
    }

    #[test]
    fn test_port_id_without_suffix_unchanged() {
        assert_eq!(port_id(".../usb2/2-1/2-1.2"), "2-1.2");
        assert_eq!(port_name(".../usb2/2-1/2-1.2"), "2-1_2");
    }

    #[test]
    fn test_port_id_stable_across_nodes() {
        // Same physical path must give the same id no matter which
        // drive node the OS assigned.
        let path = ".../usb1/1-4/1-4.1/1-4.1:1.0";
        assert_eq!(port_id(path), port_id(path));
        assert_eq!(port_id(path), "1-4.1");
    }

    #[test]
    fn test_distinct_paths_distinct_ids() {
        let a = ".../usb2/2-1/2-1.2/2-1.2:1.0";
        let b = ".../usb2/2-1/2-1.3/2-1.3:1.0";
        assert_ne!(port_id(a), port_id(b));
    }

    #[test]
    fn test_tree_outermost_first() {
        let tree = PortTree::from_id("2-1.2.2.4").unwrap();
        assert_eq!(tree.level, "2-1");
        assert_eq!(tree.depth(), 4);

        let child = tree.child.as_ref().unwrap();
        assert_eq!(child.level, "2");
        let innermost = child.child.as_ref().unwrap().child.as_ref().unwrap();
        assert_eq!(innermost.level, "4");
        assert!(innermost.child.is_none());
    }

    #[test]
    fn test_tree_single_level() {
        let tree = PortTree::from_id("2-1").unwrap();
        assert_eq!(tree.depth(), 1);
        assert!(tree.child.is_none());
    }

    #[test]
    fn test_tree_empty_id() {
        assert!(PortTree::from_id("").is_none());
    }
}
