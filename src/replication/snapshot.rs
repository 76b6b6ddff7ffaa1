// Snapshot save and load.
//
// A snapshot is a single `data` file under the snapshot directory holding
// the serialized session maps. Saving is asynchronous: the caller takes a
// consistent copy of the state first, then the file write and the
// registration with the consensus service happen on a background thread,
// and the completion closure fires exactly once.

use std::fs;
use std::path::Path;
use std::thread;

use tracing::{error, info};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::store::SnapshotPayload;

use super::consensus::CommitClosure;

/// Name of the snapshot file inside the snapshot directory.
pub const SNAPSHOT_DATA_FILE: &str = "data";

/// Destination of one snapshot save, owned by the consensus service.
pub trait SnapshotWriter: Send {
    /// Directory the snapshot files go into.
    fn path(&self) -> &Path;

    /// Registers a written file with the consensus service. Returns false
    /// when the service rejects the file.
    fn add_file(&mut self, name: &str) -> bool;
}

/// Source of one snapshot load, owned by the consensus service.
pub trait SnapshotReader {
    /// Directory the snapshot files come from.
    fn path(&self) -> &Path;
}

/// Writes a consistent state copy to the writer's directory on a background
/// thread and completes `done` with the outcome.
pub fn save_snapshot(
    payload: SnapshotPayload,
    mut writer: Box<dyn SnapshotWriter>,
    done: CommitClosure,
) {
    thread::spawn(move || {
        let result = write_snapshot(&payload, writer.as_mut());
        if let Err(err) = &result {
            error!(error = %err, "snapshot save failed");
        } else {
            info!(
                sessions = payload.root_sessions.len(),
                branches = payload.branch_sessions.len(),
                "snapshot saved"
            );
        }
        done(result);
    });
}

fn write_snapshot(
    payload: &SnapshotPayload,
    writer: &mut dyn SnapshotWriter,
) -> CoordinatorResult<()> {
    let bytes = bincode::encode_to_vec(payload, bincode::config::standard())?;
    fs::write(writer.path().join(SNAPSHOT_DATA_FILE), bytes)?;
    if !writer.add_file(SNAPSHOT_DATA_FILE) {
        return Err(CoordinatorError::consensus(
            "snapshot file rejected by the consensus service",
        ));
    }
    Ok(())
}

/// Reads and decodes the snapshot file.
pub fn load_snapshot(reader: &dyn SnapshotReader) -> CoordinatorResult<SnapshotPayload> {
    let bytes = fs::read(reader.path().join(SNAPSHOT_DATA_FILE))?;
    let (payload, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::mpsc;

    struct DirWriter {
        dir: PathBuf,
        registered: Vec<String>,
    }

    impl SnapshotWriter for DirWriter {
        fn path(&self) -> &Path {
            &self.dir
        }

        fn add_file(&mut self, name: &str) -> bool {
            self.registered.push(name.to_string());
            true
        }
    }

    struct DirReader {
        dir: PathBuf,
    }

    impl SnapshotReader for DirReader {
        fn path(&self) -> &Path {
            &self.dir
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let payload = SnapshotPayload {
            root_sessions: HashMap::from([("x1".to_string(), vec![1, 2, 3])]),
            branch_sessions: HashMap::from([(7, vec![4, 5])]),
        };

        let (done_tx, done_rx) = mpsc::channel();
        save_snapshot(
            payload,
            Box::new(DirWriter {
                dir: dir.path().to_path_buf(),
                registered: Vec::new(),
            }),
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        );
        done_rx.recv().unwrap().unwrap();

        let loaded = load_snapshot(&DirReader {
            dir: dir.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(loaded.root_sessions.get("x1"), Some(&vec![1, 2, 3]));
        assert_eq!(loaded.branch_sessions.get(&7), Some(&vec![4, 5]));
    }

    #[test]
    fn test_missing_snapshot_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_snapshot(&DirReader {
            dir: dir.path().to_path_buf(),
        });
        assert!(matches!(result, Err(CoordinatorError::Io(_))));
    }
}
