//! Supplier stream ingestion.
//!
//! Each supplier lookup runs as one streaming POST to the BOM checker. The
//! NDJSON response is decoded line by line: lookup results are written to
//! the store as they arrive and every line is passed on to the browser.
//!
//! ```text
//!  checker ──chunks──▶ NdjsonDecoder ──lines──┬──▶ client (best effort)
//!                                             └──▶ apply_lookup ──▶ refresh request
//! ```
//!
//! Processing runs in a detached task, so a client that disconnects only
//! stops receiving lines. The lookups are still recorded.

use crate::checker::BomCheckerClient;
use crate::error::Result;
use crate::ndjson::{NdjsonDecoder, StreamEvent};
use crate::price_breaks::PriceBreaks;
use crate::refresher::MetricsRefresher;
use crate::store::{BomStore, LookupUpdate};
use crate::supplier::{LookupStatus, Supplier};
use crate::tasks::spawn_detached;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

/// Lines buffered for a slow client
const CLIENT_BUFFER: usize = 64;

/// What happened to one supplier stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReport {
    pub supplier: Supplier,
    /// Result events written to at least one lookup
    pub applied: usize,
    /// Result events whose part number matched no lookup
    pub unmatched: usize,
    /// Lines that could not be decoded
    pub skipped: usize,
    /// Result events the store rejected
    pub failed: usize,
    pub transport_error: Option<String>,
}

impl StreamReport {
    fn new(supplier: Supplier) -> Self {
        Self {
            supplier,
            applied: 0,
            unmatched: 0,
            skipped: 0,
            failed: 0,
            transport_error: None,
        }
    }
}

#[derive(Clone)]
pub struct SupplierStreamer {
    checker: BomCheckerClient,
    store: Arc<dyn BomStore>,
    refresher: Arc<MetricsRefresher>,
    idle_timeout: Duration,
}

impl SupplierStreamer {
    pub fn new(
        checker: BomCheckerClient,
        store: Arc<dyn BomStore>,
        refresher: Arc<MetricsRefresher>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            checker,
            store,
            refresher,
            idle_timeout,
        }
    }

    /// Open a supplier stream and return the lines to send to the client.
    ///
    /// Errors opening the stream are returned before any line is produced.
    /// Later transport failures end the line stream with an `error` event.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn stream_supplier(
        &self,
        supplier: Supplier,
        upload_id: i64,
        rows: Vec<Value>,
    ) -> Result<ReceiverStream<Bytes>> {
        let response = self.checker.open_stream(supplier, &rows).await?;
        info!(%supplier, upload_id, "Supplier stream opened");

        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let streamer = self.clone();
        spawn_detached("supplier_stream", async move {
            let report = streamer
                .consume(supplier, upload_id, response.bytes_stream(), Some(tx))
                .await;
            log_report(upload_id, &report);
            Ok::<_, std::convert::Infallible>(())
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Run both supplier streams to completion, concurrently and independently
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn stream_all(&self, upload_id: i64, rows: Vec<Value>) -> Vec<StreamReport> {
        // Spawned so that dropping this future does not stop the streams
        let handles: Vec<_> = Supplier::ALL
            .into_iter()
            .map(|supplier| {
                let streamer = self.clone();
                let rows = rows.clone();
                tokio::spawn(async move { streamer.run_to_end(supplier, upload_id, rows).await })
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (supplier, joined) in Supplier::ALL
            .into_iter()
            .zip(futures::future::join_all(handles).await)
        {
            let report = joined.unwrap_or_else(|e| {
                let mut report = StreamReport::new(supplier);
                report.transport_error = Some(format!("stream task failed: {}", e));
                report
            });
            log_report(upload_id, &report);
            reports.push(report);
        }
        reports
    }

    async fn run_to_end(&self, supplier: Supplier, upload_id: i64, rows: Vec<Value>) -> StreamReport {
        match self.checker.open_stream(supplier, &rows).await {
            Ok(response) => {
                self.consume(supplier, upload_id, response.bytes_stream(), None)
                    .await
            }
            Err(e) => {
                let mut report = StreamReport::new(supplier);
                report.transport_error = Some(e.public_message());
                report
            }
        }
    }

    /// Decode and apply a supplier stream, copying every line to `sink`.
    ///
    /// A closed sink is ignored. A body error or an idle gap longer than the
    /// configured limit ends the stream with an `error` line.
    pub async fn consume<S, E>(
        &self,
        supplier: Supplier,
        upload_id: i64,
        body: S,
        mut sink: Option<mpsc::Sender<Bytes>>,
    ) -> StreamReport
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        tokio::pin!(body);
        let mut decoder = NdjsonDecoder::new();
        let mut report = StreamReport::new(supplier);

        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    // Error text may name the checker host, so it stays in the logs
                    error!(%supplier, upload_id, error = %e, "Supplier stream read failed");
                    report.transport_error = Some(format!("{} stream was interrupted", supplier));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    report.transport_error = Some(format!(
                        "{} stream idle for {:?}",
                        supplier, self.idle_timeout
                    ));
                    break;
                }
            };

            for line in decoder.push(&chunk) {
                self.handle_line(upload_id, &line, &mut report).await;
                forward(&mut sink, format!("{}\n", line)).await;
            }
        }

        if let Some(message) = report.transport_error.clone() {
            warn!(%supplier, upload_id, error = %message, "Supplier stream broken");
            forward(&mut sink, StreamEvent::error(message).to_line()).await;
        } else if let Some(line) = decoder.finish() {
            self.handle_line(upload_id, &line, &mut report).await;
            forward(&mut sink, format!("{}\n", line)).await;
        }

        report
    }

    async fn handle_line(&self, upload_id: i64, line: &str, report: &mut StreamReport) {
        let supplier = report.supplier;
        let event = match StreamEvent::parse(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(%supplier, error = %e, line, "Skipping malformed NDJSON line");
                metrics::counter!("bom.lines.skipped", "supplier" => supplier.as_str())
                    .increment(1);
                report.skipped += 1;
                return;
            }
        };

        let Some(status) = LookupStatus::from_event(&event.event) else {
            debug!(%supplier, event = %event.event, "Forwarding non-result event");
            return;
        };

        let Some(mpn) = event.mpn() else {
            warn!(%supplier, event = %event.event, "Result event without mpn");
            report.skipped += 1;
            return;
        };

        let update = LookupUpdate {
            mpn: mpn.to_string(),
            status,
            quantity_available: quantity_available(&event.data),
            price_breaks: PriceBreaks::from_event_data(&event.data),
            response: event.data,
        };

        match self.store.apply_lookup(upload_id, supplier, &update).await {
            Ok(0) => {
                debug!(%supplier, mpn = %update.mpn, "No lookup for part");
                report.unmatched += 1;
            }
            Ok(touched) => {
                debug!(%supplier, mpn = %update.mpn, touched, status = status.as_str(), "Lookup updated");
                metrics::counter!("bom.events.applied", "supplier" => supplier.as_str())
                    .increment(1);
                report.applied += 1;
                self.refresher.request();
            }
            Err(e) => {
                error!(%supplier, mpn = %update.mpn, error = %e, "Failed to record lookup");
                report.failed += 1;
            }
        }
    }
}

async fn forward(sink: &mut Option<mpsc::Sender<Bytes>>, line: String) {
    if let Some(tx) = sink {
        if tx.send(Bytes::from(line)).await.is_err() {
            debug!("Client disconnected, continuing without it");
            *sink = None;
        }
    }
}

fn quantity_available(data: &Value) -> Option<i64> {
    match data.get("quantity_available")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn log_report(upload_id: i64, report: &StreamReport) {
    info!(
        supplier = %report.supplier,
        upload_id,
        applied = report.applied,
        unmatched = report.unmatched,
        skipped = report.skipped,
        failed = report.failed,
        transport_error = report.transport_error.as_deref().unwrap_or_default(),
        "Supplier stream finished"
    );
}
