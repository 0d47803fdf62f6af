//! Stream stages over key-value records

use slog::{debug, Logger};
use tokio::sync::mpsc;

/// One observed write to a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: i64,
}

/// Drops records whose revision is not strictly greater than the highest
/// revision already forwarded.
///
/// Watch re-establishment and poll fallbacks replay the current snapshot;
/// this stage keeps consumers from re-processing it. Delivery stays bounded,
/// so the producer blocks on consumer backpressure.
pub fn revision_filter(logger: Logger, mut input: mpsc::Receiver<KvRecord>) -> mpsc::Receiver<KvRecord> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut max_revision: i64 = 0;
        while let Some(record) = input.recv().await {
            if record.revision <= max_revision {
                debug!(logger, "filtering stale revision";
                    "key" => &record.key,
                    "revision" => record.revision,
                    "max_revision" => max_revision,
                );
                continue;
            }

            max_revision = record.revision;
            if tx.send(record).await.is_err() {
                return;
            }
        }
    });

    rx
}
