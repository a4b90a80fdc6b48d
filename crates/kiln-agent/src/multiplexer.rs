use std::{collections::HashMap, sync::Arc, time::Duration};

use kiln_process::{OutputBatch, PlayerCount, StreamKind, SupervisorEvent};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::scanner::StatusScanner;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Default)]
struct LogBatch {
    stdout: String,
    stderr: String,
    pending: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    batches: HashMap<String, LogBatch>,
    readers: HashMap<String, Vec<JoinHandle<()>>>,
    sink: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    scanner: StatusScanner,
}

/// Coalesces worker output into rate-limited batches and feeds the status scanner.
///
/// At most one flush is pending per instance; it fires `flush_delay` after the
/// first unflushed byte and delivers one message per non-empty stream.
#[derive(Clone)]
pub struct OutputMultiplexer {
    state: Arc<Mutex<State>>,
    flush_delay: Duration,
}

impl OutputMultiplexer {
    pub fn new(flush_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            flush_delay,
        }
    }

    /// Replaces the delivery target; the previous receiver sees its channel close.
    pub async fn set_sink(&self, tx: mpsc::UnboundedSender<SupervisorEvent>) {
        self.state.lock().await.sink = Some(tx);
    }

    pub async fn emit(&self, event: SupervisorEvent) {
        let st = self.state.lock().await;
        if let Some(tx) = &st.sink {
            let _ = tx.send(event);
        }
    }

    /// Starts reading the worker's streams. Any readers from an earlier attach are stopped first.
    pub async fn attach<O, E>(&self, instance_id: &str, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(self.spawn_reader(instance_id, StreamKind::Stdout, out));
        }
        if let Some(err) = stderr {
            readers.push(self.spawn_reader(instance_id, StreamKind::Stderr, err));
        }

        let mut st = self.state.lock().await;
        if let Some(old) = st.readers.insert(instance_id.to_string(), readers) {
            for r in old {
                r.abort();
            }
        }
    }

    fn spawn_reader<R>(&self, instance_id: &str, stream: StreamKind, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mux = self.clone();
        let id = instance_id.to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            // Bytes of a UTF-8 sequence split across reads.
            let mut carry = Vec::<u8>::new();
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(instance_id = %id, ?stream, error = %e, "output read failed");
                        break;
                    }
                };
                carry.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut carry);
                if !text.is_empty() {
                    mux.append(&id, stream, &text).await;
                }
            }
            if !carry.is_empty() {
                let text = String::from_utf8_lossy(&carry).to_string();
                mux.append(&id, stream, &text).await;
            }
        })
    }

    pub async fn append(&self, instance_id: &str, stream: StreamKind, text: &str) {
        let mut st = self.state.lock().await;
        st.scanner.feed(instance_id, text);

        let batch = st.batches.entry(instance_id.to_string()).or_default();
        match stream {
            StreamKind::Stdout => batch.stdout.push_str(text),
            StreamKind::Stderr => batch.stderr.push_str(text),
        }
        if batch.pending.is_none() {
            let mux = self.clone();
            let id = instance_id.to_string();
            let delay = self.flush_delay;
            batch.pending = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                mux.flush(&id).await;
            }));
        }
    }

    pub async fn flush(&self, instance_id: &str) {
        let mut st = self.state.lock().await;
        let Some(batch) = st.batches.get_mut(instance_id) else {
            return;
        };
        batch.pending = None;
        let stdout = std::mem::take(&mut batch.stdout);
        let stderr = std::mem::take(&mut batch.stderr);

        let Some(tx) = &st.sink else {
            return;
        };
        for (stream, text) in [(StreamKind::Stdout, stdout), (StreamKind::Stderr, stderr)] {
            if text.is_empty() {
                continue;
            }
            let _ = tx.send(SupervisorEvent::Output(OutputBatch {
                instance_id: instance_id.to_string(),
                stream,
                text,
            }));
        }
    }

    /// Lets the readers hit EOF (bounded by `timeout`) and delivers whatever they produced.
    pub async fn drain(&self, instance_id: &str, timeout: Duration) {
        let readers = self.state.lock().await.readers.remove(instance_id);
        if let Some(readers) = readers {
            let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
            if tokio::time::timeout(timeout, futures_util::future::join_all(readers))
                .await
                .is_err()
            {
                for a in aborts {
                    a.abort();
                }
            }
        }

        let pending = {
            let mut st = self.state.lock().await;
            st.batches.get_mut(instance_id).and_then(|b| b.pending.take())
        };
        if let Some(p) = pending {
            p.abort();
        }
        self.flush(instance_id).await;
    }

    /// Drops buffered output, cancels the pending flush, and stops the readers.
    pub async fn discard(&self, instance_id: &str) {
        let mut st = self.state.lock().await;
        if let Some(batch) = st.batches.remove(instance_id)
            && let Some(p) = batch.pending
        {
            p.abort();
        }
        if let Some(readers) = st.readers.remove(instance_id) {
            for r in readers {
                r.abort();
            }
        }
        st.scanner.forget(instance_id);
    }

    pub async fn player_count(&self, instance_id: &str) -> Option<PlayerCount> {
        self.state.lock().await.scanner.count(instance_id)
    }
}

/// Takes the longest valid UTF-8 prefix of `carry`, leaving an incomplete trailing sequence.
/// Invalid bytes in the middle are replaced rather than held back.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(s) => {
            let out = s.to_string();
            carry.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let rest = carry.split_off(e.valid_up_to());
            let out = String::from_utf8_lossy(carry).to_string();
            *carry = rest;
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(carry).to_string();
            carry.clear();
            out
        }
    }
}
