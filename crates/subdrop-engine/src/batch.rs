//! Batch transfer bookkeeping.
//!
//! A batch is an all-or-nothing handshake over a manifest of files: one
//! accept covers every file, one reject means zero bytes move. Files of an
//! accepted batch are then sent sequentially over the same channel.

use crate::transfer::OutgoingFile;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use subdrop_proto::message::FileMeta;

/// Generate a batch id unique enough to correlate request and response.
pub fn new_batch_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tag: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("batch_{millis}_{tag:06}")
}

/// Manifest entries for a prepared batch, in send order.
pub fn manifest(files: &[OutgoingFile]) -> Vec<FileMeta> {
    files
        .iter()
        .map(|f| FileMeta {
            file_name: f.file_name.clone(),
            file_size: f.data.len() as u64,
            relative_path: f.relative_path.clone(),
        })
        .collect()
}

/// Total payload bytes across a batch.
pub fn total_size(files: &[OutgoingFile]) -> u64 {
    files.iter().map(|f| f.data.len() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ids_are_distinct() {
        let a = new_batch_id();
        let b = new_batch_id();
        assert!(a.starts_with("batch_"));
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_preserves_order_and_sizes() {
        let files = vec![
            OutgoingFile {
                file_name: "a.txt".into(),
                relative_path: "dir/a.txt".into(),
                data: vec![0; 3],
            },
            OutgoingFile {
                file_name: "b.txt".into(),
                relative_path: "dir/b.txt".into(),
                data: vec![0; 7],
            },
        ];
        let metas = manifest(&files);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].file_name, "a.txt");
        assert_eq!(metas[0].file_size, 3);
        assert_eq!(metas[1].relative_path, "dir/b.txt");
        assert_eq!(total_size(&files), 10);
    }
}
