use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_FSTYPE: &str = "none";
pub const DEFAULT_OPTIONS: &str = "defaults";

/// One mount: what is mounted where, with which type and options.
///
/// Records are immutable once built; stages derive new records (for example
/// with [`MountRecord::rebased`]) instead of editing existing ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    device: PathBuf,
    mountpoint: PathBuf,
    filesystem_type: String,
    options: String,
}

impl MountRecord {
    /// Build a record; `None` fstype and options fall back to `none` and `defaults`.
    pub fn new(
        device: impl Into<PathBuf>,
        mountpoint: impl Into<PathBuf>,
        filesystem_type: Option<&str>,
        options: Option<&str>,
    ) -> Self {
        Self {
            device: device.into(),
            mountpoint: mountpoint.into(),
            filesystem_type: filesystem_type
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_FSTYPE)
                .to_owned(),
            options: options
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_OPTIONS)
                .to_owned(),
        }
    }

    /// A bind mount of `source` onto `target`.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self::new(source, target, None, Some("bind"))
    }

    #[inline]
    pub fn device(&self) -> &Path {
        &self.device
    }

    #[inline]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    #[inline]
    pub fn filesystem_type(&self) -> &str {
        &self.filesystem_type
    }

    #[inline]
    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn is_bind(&self) -> bool {
        self.options.split(',').any(|o| o == "bind" || o == "rbind")
    }

    pub fn is_swap(&self) -> bool {
        self.filesystem_type == "swap"
    }

    /// Number of path components below `/`; parents sort before children.
    pub fn depth(&self) -> usize {
        self.mountpoint
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .count()
    }

    /// The same record with its mountpoint placed under `root`.
    #[must_use]
    pub fn rebased(&self, root: &Path) -> Self {
        Self {
            device: self.device.clone(),
            mountpoint: rebase(root, &self.mountpoint),
            filesystem_type: self.filesystem_type.clone(),
            options: self.options.clone(),
        }
    }
}

/// Join `path` below `root`, treating an absolute `path` as relative to `root`.
pub(crate) fn rebase(root: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Octal-escape the bytes fstab fields cannot carry raw (`\040` for space).
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            ' ' | '\t' | '\n' | '\\' => out.push_str(&format!("\\{:03o}", u32::from(c))),
            _ => out.push(c),
        }
    }
    out
}

/// Undo the octal escapes used in fstab and mount lists.
pub fn unescape_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|d| (b'0'..=b'7').contains(d))
        {
            let value = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(b) = u8::try_from(value) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl fmt::Display for MountRecord {
    /// Six-field fstab line; dump and pass are always zero.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} 0 0",
            escape_field(&self.device.to_string_lossy()),
            escape_field(&self.mountpoint.to_string_lossy()),
            escape_field(&self.filesystem_type),
            escape_field(&self.options)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_omitted() {
        let r = MountRecord::new("/dev/sda1", "/home", None, None);
        assert_eq!(r.filesystem_type(), "none");
        assert_eq!(r.options(), "defaults");

        let r = MountRecord::new("/dev/sda1", "/home", Some(""), Some(""));
        assert_eq!(r.filesystem_type(), "none");
        assert_eq!(r.options(), "defaults");
    }

    #[test]
    fn display_is_six_field_fstab_line() {
        let r = MountRecord::new("/dev/vda2", "/", Some("ext4"), Some("rw,relatime"));
        assert_eq!(r.to_string(), "/dev/vda2 / ext4 rw,relatime 0 0");
    }

    #[test]
    fn display_escapes_whitespace_in_paths() {
        let r = MountRecord::new("/dev/sdb1", "/srv/my data", Some("xfs"), None);
        assert_eq!(r.to_string(), "/dev/sdb1 /srv/my\\040data xfs defaults 0 0");
    }

    #[test]
    fn field_escapes_are_reversible() {
        for raw in ["/plain", "/a b", "/tab\there", "/back\\slash"] {
            assert_eq!(unescape_field(&escape_field(raw)), raw);
        }
        assert_eq!(unescape_field("/mnt/a\\040b"), "/mnt/a b");
        assert_eq!(unescape_field("trailing\\04"), "trailing\\04");
        assert_eq!(unescape_field("/not\\089octal"), "/not\\089octal");
    }

    #[test]
    fn swap_records_are_recognized() {
        assert!(MountRecord::new("/dev/sda5", "none", Some("swap"), None).is_swap());
        assert!(!MountRecord::new("/dev/sda2", "/", Some("ext4"), None).is_swap());
    }

    #[test]
    fn bind_records_are_recognized() {
        let r = MountRecord::bind("/dev", "/system-root/dev");
        assert!(r.is_bind());
        assert_eq!(r.filesystem_type(), "none");
        assert!(!MountRecord::new("/dev/sda1", "/", Some("xfs"), None).is_bind());
    }

    #[test]
    fn rebased_places_mountpoint_under_root() {
        let root = Path::new("/system-root");
        let r = MountRecord::new("/dev/sda1", "/", Some("ext4"), None).rebased(root);
        assert_eq!(r.mountpoint(), Path::new("/system-root"));

        let r = MountRecord::new("/dev/sda3", "/home", Some("xfs"), None).rebased(root);
        assert_eq!(r.mountpoint(), Path::new("/system-root/home"));
        assert_eq!(r.device(), Path::new("/dev/sda3"));
    }

    #[test]
    fn depth_counts_components() {
        assert_eq!(MountRecord::new("/d", "/", None, None).depth(), 0);
        assert_eq!(MountRecord::new("/d", "/var", None, None).depth(), 1);
        assert_eq!(MountRecord::new("/d", "/var/lib/docker", None, None).depth(), 3);
    }
}
