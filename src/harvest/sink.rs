// src/harvest/sink.rs
// =============================================================================
// The single writer that owns the output file.
//
// Workers send `code|url` records through a channel. When a worker shuts
// down it sends a Stop. The sink finishes (flushes and closes the output)
// only after it has seen one Stop per worker. If the channel closes before
// that, some worker died and the output is incomplete.
// =============================================================================

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::error::HarvestError;

/// Flush the output after this many records.
const FLUSH_EVERY: u64 = 64;

/// A resolved short code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub code: String,
    pub url: String,
}

impl Record {
    pub fn new(code: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            url: url.into(),
        }
    }
}

/// What workers send to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Record(Record),
    Stop,
}

pub struct WriteSink<W> {
    output: BufWriter<W>,
    workers: usize,
    written: u64,
}

impl<W: AsyncWrite + Unpin> WriteSink<W> {
    /// A sink that expects one Stop from each of `workers` workers.
    pub fn new(output: W, workers: usize) -> Self {
        Self {
            output: BufWriter::new(output),
            workers,
            written: 0,
        }
    }

    /// Writes records until every worker has stopped.
    ///
    /// Returns the number of records written and the output itself.
    pub async fn run(
        mut self,
        mut results: UnboundedReceiver<SinkMessage>,
    ) -> Result<(u64, W), HarvestError> {
        info!("Starting writer");
        let mut stops = 0;

        while stops < self.workers {
            match results.recv().await {
                Some(SinkMessage::Record(record)) => self.write(&record).await?,
                Some(SinkMessage::Stop) => {
                    stops += 1;
                    debug!("Writer got stop {} of {}", stops, self.workers);
                }
                None => {
                    // Keep what we have, but the run is still a failure
                    self.output.flush().await?;
                    return Err(HarvestError::Truncated {
                        received: stops,
                        expected: self.workers,
                    });
                }
            }
        }

        self.output.shutdown().await?;
        info!("Writer finished, {} records written", self.written);
        Ok((self.written, self.output.into_inner()))
    }

    async fn write(&mut self, record: &Record) -> Result<(), HarvestError> {
        if record.url.contains(|c: char| c == '\n' || c == '\r') {
            self.output.flush().await?;
            return Err(HarvestError::NewlineInUrl {
                code: record.code.clone(),
            });
        }

        let line = format!("{}|{}\n", record.code, record.url);
        self.output.write_all(line.as_bytes()).await?;
        self.written += 1;
        if self.written % FLUSH_EVERY == 0 {
            self.output.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_writes_until_every_worker_stopped() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SinkMessage::Record(Record::new("a", "http://one/"))).unwrap();
        tx.send(SinkMessage::Stop).unwrap();
        tx.send(SinkMessage::Record(Record::new("b", "http://two/?x=1|2"))).unwrap();
        tx.send(SinkMessage::Stop).unwrap();
        tx.send(SinkMessage::Stop).unwrap();

        let (written, output) = WriteSink::new(Vec::new(), 3).run(rx).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "a|http://one/\nb|http://two/?x=1|2\n"
        );
    }

    #[tokio::test]
    async fn test_stops_after_last_stop_even_if_channel_stays_open() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SinkMessage::Stop).unwrap();
        let (written, _) = WriteSink::new(Vec::new(), 1).run(rx).await.unwrap();
        assert_eq!(written, 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_truncated_when_a_worker_never_stops() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SinkMessage::Stop).unwrap();
        tx.send(SinkMessage::Stop).unwrap();
        drop(tx);

        let result = WriteSink::new(Vec::new(), 3).run(rx).await;
        assert!(matches!(
            result,
            Err(HarvestError::Truncated { received: 2, expected: 3 })
        ));
    }

    #[tokio::test]
    async fn test_newline_in_url_is_fatal() {
        for url in ["http://a/\nb", "http://a/\rb"] {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(SinkMessage::Record(Record::new("x", url))).unwrap();
            tx.send(SinkMessage::Stop).unwrap();

            let result = WriteSink::new(Vec::new(), 1).run(rx).await;
            assert!(matches!(result, Err(HarvestError::NewlineInUrl { code }) if code == "x"));
        }
    }
}
