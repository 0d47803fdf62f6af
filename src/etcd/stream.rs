//! Watch streams over etcd keys
//!
//! Produces a lazy sequence of key revisions: the current value of each key
//! first, then every subsequent write as etcd reports it. Watches can drop
//! events across reconnects, so a poll interval bounds the time between
//! forced full reads; compose [`crate::streams::revision_filter`] downstream
//! to drop the duplicates this replays.

use crate::streams::KvRecord;
use etcd_client::{Client, EventType, KeyValue, WatchOptions};
use slog::{debug, error, info, Logger};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Keys to watch.
    pub keys: Vec<String>,

    /// Time between forced full reads of each key.
    pub poll_interval: Duration,

    /// Deadline for each full read.
    pub get_timeout: Duration,
}

impl StreamOptions {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            poll_interval: Duration::from_secs(1),
            get_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }
}

/// Open a stream of revisions for the configured keys.
///
/// Records from different keys interleave in arbitrary order. Delivery is
/// over a bounded channel, so the producers block on consumer backpressure.
/// Cancelling `token` terminates the stream; the receiver then drains and
/// closes.
pub fn stream(
    logger: Logger,
    client: Client,
    token: CancellationToken,
    options: StreamOptions,
) -> mpsc::Receiver<KvRecord> {
    let (tx, rx) = mpsc::channel(16);

    for key in options.keys.clone() {
        let logger = logger.new(slog::o!("key" => key.clone()));
        tokio::spawn(watch_key(
            logger,
            client.clone(),
            token.clone(),
            key,
            options.clone(),
            tx.clone(),
        ));
    }

    rx
}

async fn watch_key(
    logger: Logger,
    mut client: Client,
    token: CancellationToken,
    key: String,
    options: StreamOptions,
    tx: mpsc::Sender<KvRecord>,
) {
    loop {
        if token.is_cancelled() {
            return;
        }

        // Prime the consumer with the current value, then watch from the
        // revision we observed.
        let revision = match read_key(&logger, &mut client, &key, &options, &tx).await {
            Ok(Some(revision)) => revision,
            Ok(None) => 0,
            Err(StreamClosed) => return,
        };

        let watch_options = WatchOptions::new().with_start_revision(revision + 1);
        let (mut watcher, mut events) = match client.watch(key.as_str(), Some(watch_options)).await
        {
            Ok(watch) => watch,
            Err(err) => {
                error!(logger, "failed to establish watch"; "error" => %err);
                if sleep_or_cancelled(&token, options.poll_interval).await {
                    return;
                }
                continue;
            }
        };

        let mut poll = interval_at(
            Instant::now() + options.poll_interval,
            options.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = watcher.cancel().await;
                    return;
                }
                _ = poll.tick() => {
                    // Forced full read to recover from missed watch events.
                    if read_key(&logger, &mut client, &key, &options, &tx).await.is_err() {
                        let _ = watcher.cancel().await;
                        return;
                    }
                }
                message = events.message() => match message {
                    Ok(Some(response)) => {
                        for event in response.events() {
                            if event.event_type() != EventType::Put {
                                continue;
                            }

                            if let Some(kv) = event.kv() {
                                if tx.send(to_record(kv)).await.is_err() {
                                    let _ = watcher.cancel().await;
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        info!(logger, "watch channel closed, re-establishing");
                        break;
                    }
                    Err(err) => {
                        error!(logger, "watch failed, re-establishing"; "error" => %err);
                        break;
                    }
                }
            }
        }

        if sleep_or_cancelled(&token, options.poll_interval).await {
            return;
        }
    }
}

struct StreamClosed;

/// Read the key once, bounded by the get timeout, and emit its current
/// value. Returns the observed revision, or `Err` when the consumer has
/// gone away.
async fn read_key(
    logger: &Logger,
    client: &mut Client,
    key: &str,
    options: &StreamOptions,
    tx: &mpsc::Sender<KvRecord>,
) -> std::result::Result<Option<i64>, StreamClosed> {
    let response = match timeout(options.get_timeout, client.get(key, None)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            error!(logger, "failed to get key"; "error" => %err);
            return Ok(None);
        }
        Err(_) => {
            debug!(logger, "get timed out");
            return Ok(None);
        }
    };

    let Some(kv) = response.kvs().first() else {
        return Ok(None);
    };

    let record = to_record(kv);
    let revision = record.revision;
    if tx.send(record).await.is_err() {
        return Err(StreamClosed);
    }

    Ok(Some(revision))
}

fn to_record(kv: &KeyValue) -> KvRecord {
    KvRecord {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        revision: kv.mod_revision(),
    }
}

/// Sleep for `duration` unless the token fires first. Returns `true` when
/// cancelled.
async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
