/// Batch staging of input files into an environment before execution.
use crate::environ::Environment;
use crate::types::{EnvError, FileError, FileErrorKind, FileSource, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::thread;

/// Stage a batch of files into `env`, one worker thread per entry.
///
/// Entries are independent: a failure in one never stops the others, and
/// every failure is collected with the phase it occurred in. The call
/// succeeds only when every entry succeeded; otherwise all collected
/// failures are returned together so the caller can report them per file.
pub fn copy_in(env: &dyn Environment, files: HashMap<String, FileSource>) -> Result<()> {
    let errors: Mutex<Vec<FileError>> = Mutex::new(Vec::new());

    thread::scope(|s| {
        for (name, source) in &files {
            let errors = &errors;
            s.spawn(move || {
                if let Err((kind, message)) = stage_one(env, name, source) {
                    errors.lock().unwrap().push(FileError {
                        name: name.clone(),
                        kind,
                        message,
                    });
                }
            });
        }
    });

    let errors = errors.into_inner().unwrap();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EnvError::Staging(errors))
    }
}

type StageResult = std::result::Result<(), (FileErrorKind, String)>;

fn stage_one(env: &dyn Environment, name: &str, source: &FileSource) -> StageResult {
    match source {
        FileSource::HostDir(path) => {
            match std::fs::metadata(path) {
                Ok(md) if md.is_dir() => {}
                Ok(_) => {
                    return Err((
                        FileErrorKind::UnknownFile,
                        format!("{}: not a directory", path.display()),
                    ))
                }
                Err(e) => return Err((FileErrorKind::UnknownFile, e.to_string())),
            }
            env.copy_dir(path, Path::new(name))
                .map_err(|e| (FileErrorKind::CopyContent, e.to_string()))
        }
        FileSource::HostFile(path) => {
            let mut src = File::open(path).map_err(|e| (FileErrorKind::OpenFile, e.to_string()))?;
            write_to_env(env, name, &mut src)
        }
        FileSource::Memory(bytes) => write_to_env(env, name, &mut bytes.as_slice()),
    }
}

/// Create the destination (parents included) and stream `src` into it
fn write_to_env(env: &dyn Environment, name: &str, src: &mut dyn io::Read) -> StageResult {
    let dst = Path::new(name);
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            env.mkdir_all(parent, Mode::from_bits_truncate(0o777))
                .map_err(|e| (FileErrorKind::CreateDir, e.to_string()))?;
        }
    }
    let mut out = env
        .open_at(
            dst,
            OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o777),
        )
        .map_err(|e| (FileErrorKind::CreateFile, e.to_string()))?;
    io::copy(src, &mut out).map_err(|e| (FileErrorKind::CopyContent, e.to_string()))?;
    Ok(())
}

/// Create a batch of symlinks inside `env`, in the given order.
///
/// Unlike [`copy_in`] this runs sequentially and stops at the first
/// failure: link order can matter (a later link may point through an
/// earlier one), so continuing past a failure would cascade.
pub fn stage_symlinks(env: &dyn Environment, links: &[(String, String)]) -> Result<()> {
    for (link, target) in links {
        if let Err(e) = env.symlink(Path::new(target), Path::new(link)) {
            return Err(EnvError::SymlinkBatch(FileError {
                name: link.clone(),
                kind: FileErrorKind::Symlink,
                message: e.to_string(),
            }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::NopContainer;
    use crate::environ::{EnvironConfig, SandboxEnviron};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn environ(root: &TempDir) -> SandboxEnviron {
        SandboxEnviron::new(Arc::new(NopContainer), EnvironConfig::new(root.path())).unwrap()
    }

    #[test]
    fn test_copy_in_memory_sources() {
        let root = TempDir::new().unwrap();
        let env = environ(&root);
        let mut files = HashMap::new();
        files.insert("main.py".to_string(), FileSource::Memory(b"print(1)".to_vec()));
        files.insert(
            "lib/helper.py".to_string(),
            FileSource::Memory(b"x = 2".to_vec()),
        );
        copy_in(&env, files).unwrap();
        assert_eq!(fs::read(root.path().join("main.py")).unwrap(), b"print(1)");
        assert_eq!(fs::read(root.path().join("lib/helper.py")).unwrap(), b"x = 2");
    }

    #[test]
    fn test_copy_in_host_file_source() {
        let host = TempDir::new().unwrap();
        fs::write(host.path().join("input.txt"), b"case data").unwrap();

        let root = TempDir::new().unwrap();
        let env = environ(&root);
        let mut files = HashMap::new();
        files.insert(
            "input.txt".to_string(),
            FileSource::HostFile(host.path().join("input.txt")),
        );
        copy_in(&env, files).unwrap();
        assert_eq!(fs::read(root.path().join("input.txt")).unwrap(), b"case data");
    }

    #[test]
    fn test_copy_in_host_dir_source() {
        let host = TempDir::new().unwrap();
        fs::write(host.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(host.path().join("deep")).unwrap();
        fs::write(host.path().join("deep/b.txt"), b"b").unwrap();

        let root = TempDir::new().unwrap();
        let env = environ(&root);
        let mut files = HashMap::new();
        files.insert(
            "tree".to_string(),
            FileSource::HostDir(host.path().to_path_buf()),
        );
        copy_in(&env, files).unwrap();
        assert_eq!(fs::read(root.path().join("tree/a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(root.path().join("tree/deep/b.txt")).unwrap(), b"b");
    }

    #[test]
    fn test_copy_in_collects_failures_without_stopping_others() {
        let root = TempDir::new().unwrap();
        let env = environ(&root);
        let mut files = HashMap::new();
        files.insert("good".to_string(), FileSource::Memory(b"fine".to_vec()));
        files.insert(
            "missing".to_string(),
            FileSource::HostFile("/nonexistent/source".into()),
        );
        files.insert(
            "not-a-dir".to_string(),
            FileSource::HostDir("/nonexistent/tree".into()),
        );

        let err = copy_in(&env, files).unwrap_err();
        let EnvError::Staging(mut errors) = err else {
            panic!("expected staging error");
        };
        errors.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].name, "missing");
        assert_eq!(errors[0].kind, FileErrorKind::OpenFile);
        assert_eq!(errors[1].name, "not-a-dir");
        assert_eq!(errors[1].kind, FileErrorKind::UnknownFile);
        // The healthy entry landed despite its siblings failing.
        assert_eq!(fs::read(root.path().join("good")).unwrap(), b"fine");
    }

    #[test]
    fn test_copy_in_reports_dir_source_that_is_a_file() {
        let host = TempDir::new().unwrap();
        fs::write(host.path().join("plain"), b"x").unwrap();

        let root = TempDir::new().unwrap();
        let env = environ(&root);
        let mut files = HashMap::new();
        files.insert(
            "out".to_string(),
            FileSource::HostDir(host.path().join("plain")),
        );
        let err = copy_in(&env, files).unwrap_err();
        let EnvError::Staging(errors) = err else {
            panic!("expected staging error");
        };
        assert_eq!(errors[0].kind, FileErrorKind::UnknownFile);
        assert!(errors[0].message.contains("not a directory"));
    }

    #[test]
    fn test_copy_in_overwrites_previous_content() {
        let root = TempDir::new().unwrap();
        let env = environ(&root);
        fs::write(root.path().join("f"), b"stale and much longer").unwrap();
        let mut files = HashMap::new();
        files.insert("f".to_string(), FileSource::Memory(b"new".to_vec()));
        copy_in(&env, files).unwrap();
        assert_eq!(fs::read(root.path().join("f")).unwrap(), b"new");
    }

    #[test]
    fn test_stage_symlinks_creates_links_in_order() {
        let root = TempDir::new().unwrap();
        let env = environ(&root);
        fs::write(root.path().join("real.txt"), b"content").unwrap();
        let links = vec![
            ("alias".to_string(), "real.txt".to_string()),
            // Chained link only resolves because the previous one exists.
            ("alias2".to_string(), "alias".to_string()),
        ];
        stage_symlinks(&env, &links).unwrap();
        assert_eq!(fs::read(root.path().join("alias2")).unwrap(), b"content");
        assert!(fs::symlink_metadata(root.path().join("alias"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_stage_symlinks_stops_at_first_failure() {
        let root = TempDir::new().unwrap();
        let env = environ(&root);
        let links = vec![
            // Escaping link name is rejected before touching the filesystem.
            ("/etc/escape".to_string(), "target".to_string()),
            ("never-created".to_string(), "target".to_string()),
        ];
        let err = stage_symlinks(&env, &links).unwrap_err();
        let EnvError::SymlinkBatch(fe) = err else {
            panic!("expected symlink error");
        };
        assert_eq!(fe.name, "/etc/escape");
        assert_eq!(fe.kind, FileErrorKind::Symlink);
        assert!(!root.path().join("never-created").exists());
    }
}
