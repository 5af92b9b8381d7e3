use crate::record::{unescape_field, MountRecord};
use crate::{fsync_dir, StoreError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Symbolic device specifiers and the `/dev/disk` directory each resolves into.
const SYMBOLIC_SPECS: [(&str, &str); 3] = [
    ("UUID=", "by-uuid"),
    ("LABEL=", "by-label"),
    ("PARTUUID=", "by-partuuid"),
];

/// Rewrite `UUID=`, `LABEL=` and `PARTUUID=` specifiers to their
/// `/dev/disk/by-*` path; anything else is returned verbatim.
pub fn resolve_device_spec(spec: &str) -> PathBuf {
    for (prefix, kind) in SYMBOLIC_SPECS {
        if let Some(value) = spec.strip_prefix(prefix) {
            return PathBuf::from(format!("/dev/disk/{kind}/{value}"));
        }
    }
    PathBuf::from(spec)
}

/// Ordered list of mounts. Insertion order is mount order; teardown walks it
/// backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<MountRecord>) -> Self {
        Self { records }
    }

    /// Read an fstab-style file and append its usable entries in file order.
    ///
    /// Comments, blank lines, malformed lines and swap entries are skipped.
    /// Entries whose resolved device does not exist on this host are dropped
    /// with a warning.
    pub fn read(&mut self, path: &Path) -> Result<(), StoreError> {
        let content = fs::read_to_string(path)?;
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (spec, mountpoint) = match fields.as_slice() {
                [spec, mountpoint, ..] => (unescape_field(spec), unescape_field(mountpoint)),
                _ => {
                    warn!(
                        "{}:{}: skipping malformed entry '{line}'",
                        path.display(),
                        index + 1
                    );
                    continue;
                }
            };
            let fstype = fields.get(2).map(|f| unescape_field(f));
            let options = fields.get(3).map(|f| unescape_field(f));
            let record = MountRecord::new(
                resolve_device_spec(&spec),
                &mountpoint,
                fstype.as_deref(),
                options.as_deref(),
            );

            if record.is_swap() {
                debug!("skipping swap entry {spec}");
                continue;
            }
            if !record.device().exists() {
                warn!(
                    "device {} for mountpoint {mountpoint} does not exist, skipping",
                    record.device().display()
                );
                continue;
            }
            self.records.push(record);
        }
        Ok(())
    }

    /// Convenience wrapper: a fresh table read from `path`.
    pub fn read_file(path: &Path) -> Result<Self, StoreError> {
        let mut table = Self::new();
        table.read(path)?;
        Ok(table)
    }

    /// Like [`read_file`](Self::read_file), but a missing file is an empty table.
    pub fn read_if_exists(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            Self::read_file(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn add_entry(
        &mut self,
        device: impl Into<PathBuf>,
        mountpoint: impl Into<PathBuf>,
        fstype: Option<&str>,
        options: Option<&str>,
    ) {
        self.records
            .push(MountRecord::new(device, mountpoint, fstype, options));
    }

    pub fn push(&mut self, record: MountRecord) {
        self.records.push(record);
    }

    pub fn extend(&mut self, other: MountTable) {
        self.records.extend(other.records);
    }

    /// Overwrite `path` with one six-field line per record, in order.
    ///
    /// The new content is written to a sibling temp file and renamed into
    /// place, so a reader sees either the previous table or the new one.
    pub fn export(&self, path: &Path) -> Result<(), StoreError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => return Err(StoreError::NoParent(path.display().to_string())),
        };
        fs::create_dir_all(&dir)?;

        let mut content = String::new();
        for record in &self.records {
            content.push_str(&record.to_string());
            content.push('\n');
        }

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        debug!("exported {} mount records to {}", self.len(), path.display());
        Ok(())
    }

    /// Snapshot of the records in stored order.
    pub fn get_devices(&self) -> &[MountRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_mountpoint(&self, mountpoint: &Path) -> bool {
        self.records.iter().any(|r| r.mountpoint() == mountpoint)
    }

    /// Stable sort so every parent mountpoint comes before its children.
    #[must_use]
    pub fn sorted_by_depth(&self) -> Self {
        let mut records = self.records.clone();
        records.sort_by_key(MountRecord::depth);
        Self { records }
    }
}

impl IntoIterator for MountTable {
    type Item = MountRecord;
    type IntoIter = std::vec::IntoIter<MountRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a MountTable {
    type Item = &'a MountRecord;
    type IntoIter = std::slice::Iter<'a, MountRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    fn fake_device(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn symbolic_specs_resolve_to_dev_disk_paths() {
        assert_eq!(
            resolve_device_spec("UUID=ec7aaf92-30ea-4c07-991a-4700177ce1b8"),
            PathBuf::from("/dev/disk/by-uuid/ec7aaf92-30ea-4c07-991a-4700177ce1b8")
        );
        assert_eq!(
            resolve_device_spec("LABEL=foo"),
            PathBuf::from("/dev/disk/by-label/foo")
        );
        assert_eq!(
            resolve_device_spec("PARTUUID=3c8bd108-01"),
            PathBuf::from("/dev/disk/by-partuuid/3c8bd108-01")
        );
        assert_eq!(resolve_device_spec("/dev/sda1"), PathBuf::from("/dev/sda1"));
    }

    #[test]
    fn read_skips_comments_swap_and_missing_devices() {
        let dir = tempfile::tempdir().unwrap();
        let root_dev = fake_device(dir.path(), "root");
        let swap_dev = fake_device(dir.path(), "swap");
        let fstab = dir.path().join("fstab");
        fs::write(
            &fstab,
            format!(
                "# static file system information\n\
                 \n\
                 {} / ext4 acl,user_xattr 0 1\n\
                 {} swap swap defaults 0 0\n\
                 {}/absent /home xfs defaults 0 2\n\
                 UUID=does-not-exist-anywhere /srv btrfs subvol=srv 0 0\n",
                root_dev.display(),
                swap_dev.display(),
                dir.path().display()
            ),
        )
        .unwrap();

        let table = MountTable::read_file(&fstab).unwrap();
        assert_eq!(table.len(), 1);
        let root = &table.get_devices()[0];
        assert_eq!(root.device(), root_dev);
        assert_eq!(root.mountpoint(), Path::new("/"));
        assert_eq!(root.filesystem_type(), "ext4");
        assert_eq!(root.options(), "acl,user_xattr");
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn read_warns_about_each_dropped_device() {
        let dir = tempfile::tempdir().unwrap();
        let root_dev = fake_device(dir.path(), "root");
        let missing = dir.path().join("vanished");
        let fstab = dir.path().join("fstab");
        fs::write(
            &fstab,
            format!(
                "{} / ext4 defaults 0 1\n{} /home xfs defaults 0 2\n{} swap swap defaults 0 0\n",
                root_dev.display(),
                missing.display(),
                root_dev.display()
            ),
        )
        .unwrap();

        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.clone())
            .with_ansi(false)
            .finish();
        let table =
            tracing::subscriber::with_default(subscriber, || MountTable::read_file(&fstab)).unwrap();

        assert_eq!(table.len(), 1);
        let text = log.text();
        let warnings: Vec<&str> = text.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 1, "log: {text}");
        assert!(warnings[0].contains(&missing.display().to_string()));
        assert!(warnings[0].contains("/home"));
    }

    #[test]
    fn spaced_paths_survive_export_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fake_device(dir.path(), "my disk");

        let mut table = MountTable::new();
        table.add_entry(&dev, "/system-root/srv/my data", Some("xfs"), None);
        let path = dir.path().join("system-root.fstab");
        table.export(&path).unwrap();

        let line = fs::read_to_string(&path).unwrap();
        assert_eq!(line.lines().next().unwrap().split(' ').count(), 6);
        assert_eq!(MountTable::read_file(&path).unwrap(), table);
    }

    #[test]
    fn read_defaults_short_lines_and_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fake_device(dir.path(), "dev");
        let fstab = dir.path().join("fstab");
        fs::write(
            &fstab,
            format!("lonely\n{} /data\n", dev.display()),
        )
        .unwrap();

        let table = MountTable::read_file(&fstab).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_devices()[0].filesystem_type(), "none");
        assert_eq!(table.get_devices()[0].options(), "defaults");
    }

    #[test]
    fn read_appends_to_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let dev = fake_device(dir.path(), "dev");
        let fstab = dir.path().join("fstab");
        fs::write(&fstab, format!("{} /var ext4 defaults 0 0\n", dev.display())).unwrap();

        let mut table = MountTable::new();
        table.add_entry(&dev, "/", Some("ext4"), None);
        table.read(&fstab).unwrap();
        let points: Vec<_> = table.get_devices().iter().map(MountRecord::mountpoint).collect();
        assert_eq!(points, vec![Path::new("/"), Path::new("/var")]);
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MountTable::read_file(&dir.path().join("nope")).is_err());
        assert!(MountTable::read_if_exists(&dir.path().join("nope"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn export_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = fake_device(dir.path(), "a");
        let b = fake_device(dir.path(), "b");
        let c = fake_device(dir.path(), "c");

        let mut table = MountTable::new();
        table.add_entry(&a, "/system-root", Some("ext4"), Some("rw"));
        table.add_entry(&b, "/system-root/home", None, None);
        table.add_entry(&c, "/system-root/dev", None, Some("bind"));

        let path = dir.path().join("system-root.fstab");
        table.export(&path).unwrap();
        let back = MountTable::read_file(&path).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn export_overwrites_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = fake_device(dir.path(), "a");
        let path = dir.path().join("table");

        let mut first = MountTable::new();
        first.add_entry(&a, "/one", None, None);
        first.add_entry(&a, "/two", None, None);
        first.export(&path).unwrap();

        MountTable::new().export(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn root_entry_survives_and_swap_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let root_dev = fake_device(dir.path(), "vda2");
        let swap_dev = fake_device(dir.path(), "vda3");
        let fstab = dir.path().join("fstab");
        fs::write(
            &fstab,
            format!(
                "{} / ext4 defaults 0 1\n{} swap swap defaults 0 0\n",
                root_dev.display(),
                swap_dev.display()
            ),
        )
        .unwrap();

        let table = MountTable::read_file(&fstab).unwrap();
        assert_eq!(table.len(), 1);

        let out = dir.path().join("out.fstab");
        table.export(&out).unwrap();
        let content = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            format!("{} / ext4 defaults 0 0", root_dev.display())
        );
    }

    #[test]
    fn sorted_by_depth_is_stable() {
        let mut table = MountTable::new();
        table.add_entry("/dev/b", "/var/lib", None, None);
        table.add_entry("/dev/c", "/home", None, None);
        table.add_entry("/dev/a", "/", None, None);
        table.add_entry("/dev/d", "/var", None, None);

        let sorted = table.sorted_by_depth();
        let points: Vec<_> = sorted
            .get_devices()
            .iter()
            .map(|r| r.mountpoint().to_path_buf())
            .collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/home"),
                PathBuf::from("/var"),
                PathBuf::from("/var/lib"),
            ]
        );
    }
}
