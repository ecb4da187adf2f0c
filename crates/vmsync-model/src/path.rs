use std::fmt;

/// Hierarchical key addressing the remote-ID map.
///
/// Paths are built only from platform IDs (never remote IDs), so the whole
/// map can be rebuilt from locally known entities plus one remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformPath {
    segments: Vec<String>,
}

impl PlatformPath {
    pub fn infrastructure(infrastructure_platform_id: &str) -> Self {
        Self {
            segments: vec![infrastructure_platform_id.to_string()],
        }
    }

    pub fn machine(infrastructure_platform_id: &str, machine_platform_id: &str) -> Self {
        Self {
            segments: vec![
                infrastructure_platform_id.to_string(),
                machine_platform_id.to_string(),
            ],
        }
    }

    pub fn disk(
        infrastructure_platform_id: &str,
        machine_platform_id: &str,
        disk_platform_id: &str,
    ) -> Self {
        Self::machine(infrastructure_platform_id, machine_platform_id).child(disk_platform_id)
    }

    pub fn nic(
        infrastructure_platform_id: &str,
        machine_platform_id: &str,
        nic_platform_id: &str,
    ) -> Self {
        Self::machine(infrastructure_platform_id, machine_platform_id).child(nic_platform_id)
    }

    fn child(mut self, platform_id: &str) -> Self {
        self.segments.push(platform_id.to_string());
        self
    }

    /// Path of the containing level, `None` at the infrastructure root.
    pub fn parent(&self) -> Option<PlatformPath> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(PlatformPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn key(&self) -> String {
        self.segments.join("/")
    }

    /// Inverse of [`PlatformPath::key`].
    pub fn from_key(key: &str) -> Self {
        Self {
            segments: key.split('/').map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for PlatformPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_by_platform_id() {
        let p = PlatformPath::disk("dc-1", "vm-2", "disk-3");
        assert_eq!(p.key(), "dc-1/vm-2/disk-3");
        assert_eq!(p.parent().unwrap().key(), "dc-1/vm-2");
        assert_eq!(p.parent().unwrap().parent().unwrap().key(), "dc-1");
        assert!(PlatformPath::infrastructure("dc-1").parent().is_none());
        assert_eq!(PlatformPath::from_key("dc-1/vm-2/disk-3"), p);
    }
}
