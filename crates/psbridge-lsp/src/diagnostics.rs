// ABOUTME: Debounced diagnostics: each edit cancels the pending run and restarts the delay
// ABOUTME: Per-document generation counters keep an older run from publishing over a newer one
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lsp_types::{PublishDiagnosticsParams, Url};
use psbridge::analysis::{Analyzer, DiagnosticMarker};
use psbridge::outbound::Outbound;
use psbridge::workspace::Workspace;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::marker_to_diagnostic;

const PUBLISH_METHOD: &str = "textDocument/publishDiagnostics";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Clone, Copy)]
struct Generation {
    latest: u64,
    published: u64,
}

#[derive(Debug, Default)]
struct Documents {
    dirty: BTreeSet<String>,
    generations: HashMap<String, Generation>,
    markers: HashMap<String, Vec<DiagnosticMarker>>,
}

struct Inner {
    workspace: Arc<dyn Workspace>,
    analyzer: Arc<dyn Analyzer>,
    outbound: Outbound,
    delay: Duration,
    pending: Mutex<CancellationToken>,
    documents: Mutex<Documents>,
}

/// Schedules analyzer runs and publishes their diagnostics
#[derive(Clone)]
pub struct DiagnosticsScheduler {
    inner: Arc<Inner>,
}

impl DiagnosticsScheduler {
    /// Scheduler publishing through `outbound` after `delay` of quiet
    pub fn new(
        workspace: Arc<dyn Workspace>,
        analyzer: Arc<dyn Analyzer>,
        outbound: Outbound,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                workspace,
                analyzer,
                outbound,
                delay,
                pending: Mutex::new(CancellationToken::new()),
                documents: Mutex::new(Documents::default()),
            }),
        }
    }

    /// Mark a document dirty and restart the debounce
    ///
    /// The previous pending run is cancelled; its documents carry over into
    /// the new run. A run that already started analyzing is not interrupted.
    pub fn schedule(&self, uri: &str) {
        {
            let mut documents = lock(&self.inner.documents);
            documents.dirty.insert(uri.to_owned());
            documents
                .generations
                .entry(uri.to_owned())
                .or_default()
                .latest += 1;
        }

        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&self.inner.pending), token.clone());
        previous.cancel();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!("Diagnostics run superseded by a newer edit"),
                () = tokio::time::sleep(inner.delay) => inner.run().await,
            }
        });
    }

    /// Forget a closed document and publish an empty set for it
    pub fn clear(&self, uri: &str) {
        let mut documents = lock(&self.inner.documents);
        documents.dirty.remove(uri);
        documents.markers.remove(uri);
        let generation = documents.generations.entry(uri.to_owned()).or_default();
        generation.latest += 1;
        generation.published = generation.latest;
        self.inner.send(uri, None, Vec::new());
    }

    /// Markers of the last publication for a document
    pub fn markers(&self, uri: &str) -> Vec<DiagnosticMarker> {
        lock(&self.inner.documents)
            .markers
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }
}

impl Inner {
    async fn run(&self) {
        let batch: Vec<(String, u64)> = {
            let mut documents = lock(&self.documents);
            let dirty = std::mem::take(&mut documents.dirty);
            dirty
                .into_iter()
                .map(|uri| {
                    let generation = documents.generations.get(&uri).map_or(0, |g| g.latest);
                    (uri, generation)
                })
                .collect()
        };

        for (uri, generation) in batch {
            self.analyze(uri, generation).await;
        }
    }

    async fn analyze(&self, uri: String, generation: u64) {
        let file = match self.workspace.get_file(&uri) {
            Ok(file) => file,
            Err(e) => {
                debug!(%uri, error = %e, "Skipping diagnostics for unavailable document");
                return;
            }
        };
        if !file.is_script() {
            return;
        }

        let markers = match self.analyzer.analyze(&file).await {
            Ok(markers) => markers,
            Err(e) => {
                warn!(%uri, analyzer = self.analyzer.name(), error = %e, "Analysis failed");
                Vec::new()
            }
        };

        let mut documents = lock(&self.documents);
        let latest = documents.generations.entry(uri.clone()).or_default();
        if generation <= latest.published {
            debug!(%uri, generation, published = latest.published, "Discarding stale diagnostics");
            return;
        }
        latest.published = generation;
        // Sent under the lock so publications leave in generation order
        self.send(&uri, Some(file.version), markers.clone());
        documents.markers.insert(uri, markers);
    }

    fn send(&self, uri: &str, version: Option<i32>, markers: Vec<DiagnosticMarker>) {
        let Ok(url) = Url::parse(uri) else {
            warn!(uri, "Cannot publish diagnostics for an unparsable URI");
            return;
        };
        let diagnostics = markers
            .iter()
            .map(|marker| marker_to_diagnostic(marker, self.analyzer.name()))
            .collect();
        let params = PublishDiagnosticsParams::new(url, diagnostics, version);
        if let Err(e) = self.outbound.send_event(PUBLISH_METHOD, &params) {
            warn!(uri, error = %e, "Failed to queue diagnostics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psbridge::codec::{channel, MessageReader};
    use psbridge::message::Message;
    use psbridge::testing::StaticAnalyzer;
    use psbridge::workspace::InMemoryWorkspace;
    use psbridge::JsonRpcDialect;
    use serde_json::Value;
    use tokio::io::DuplexStream;

    const URI: &str = "file:///tmp/script.ps1";
    const DELAY: Duration = Duration::from_millis(750);

    struct Harness {
        workspace: Arc<InMemoryWorkspace>,
        analyzer: Arc<StaticAnalyzer>,
        scheduler: DiagnosticsScheduler,
        reader: MessageReader<DuplexStream>,
    }

    fn harness(analyzer: StaticAnalyzer) -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sender, writer) = channel(server, Arc::new(JsonRpcDialect));
        tokio::spawn(writer.run(CancellationToken::new()));
        let workspace = Arc::new(InMemoryWorkspace::default());
        let analyzer = Arc::new(analyzer);
        let scheduler = DiagnosticsScheduler::new(
            Arc::clone(&workspace) as Arc<dyn Workspace>,
            Arc::clone(&analyzer) as Arc<dyn Analyzer>,
            Outbound::new(sender),
            DELAY,
        );
        Harness {
            workspace,
            analyzer,
            scheduler,
            reader: MessageReader::new(client, Arc::new(JsonRpcDialect)),
        }
    }

    async fn next_publication(reader: &mut MessageReader<DuplexStream>) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(30), reader.read_message())
            .await
            .expect("timely publication")
            .expect("read")
            .expect("frame")
            .expect("decode");
        match message {
            Message::Event(event) => {
                assert_eq!(event.method, PUBLISH_METHOD);
                event.params
            }
            other => panic!("expected publication, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_into_one_run() {
        let mut h = harness(StaticAnalyzer::new("gci", "AvoidAlias"));
        h.workspace.open(URI, 1, "gci\n".to_owned());
        h.scheduler.schedule(URI);
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.workspace.open(URI, 2, "gci\ngci\n".to_owned());
        h.scheduler.schedule(URI);

        let params = next_publication(&mut h.reader).await;
        assert_eq!(params["version"], 2);
        assert_eq!(params["diagnostics"].as_array().map(Vec::len), Some(2));
        assert_eq!(h.analyzer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_runs_end_on_the_latest_source() {
        let mut h = harness(
            StaticAnalyzer::new("gci", "AvoidAlias").with_delay(Duration::from_secs(5)),
        );
        h.workspace.open(URI, 1, "gci\n".to_owned());
        h.scheduler.schedule(URI);
        // the first run is analyzing when the second edit lands
        tokio::time::sleep(DELAY + Duration::from_millis(10)).await;
        h.workspace.open(URI, 2, "Get-ChildItem\n".to_owned());
        h.scheduler.schedule(URI);

        let first = next_publication(&mut h.reader).await;
        let second = next_publication(&mut h.reader).await;
        assert_eq!(first["version"], 1);
        assert_eq!(second["version"], 2);
        assert_eq!(second["diagnostics"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn older_generation_never_publishes_over_newer() {
        let mut h = harness(StaticAnalyzer::new("gci", "AvoidAlias"));
        h.workspace.open(URI, 3, "gci\n".to_owned());
        lock(&h.scheduler.inner.documents)
            .generations
            .insert(URI.to_owned(), Generation { latest: 2, published: 0 });

        h.scheduler.inner.analyze(URI.to_owned(), 2).await;
        h.scheduler.inner.analyze(URI.to_owned(), 1).await;

        let published = next_publication(&mut h.reader).await;
        assert_eq!(published["version"], 3);
        let quiet = tokio::time::timeout(Duration::from_millis(200), h.reader.read_message()).await;
        assert!(quiet.is_err(), "stale run must not publish");
        assert_eq!(h.analyzer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_publishes_empty_set_and_drops_markers() {
        let mut h = harness(StaticAnalyzer::new("gci", "AvoidAlias"));
        h.workspace.open(URI, 1, "gci\n".to_owned());
        h.scheduler.schedule(URI);
        let params = next_publication(&mut h.reader).await;
        assert_eq!(params["diagnostics"].as_array().map(Vec::len), Some(1));
        assert_eq!(h.scheduler.markers(URI).len(), 1);

        h.scheduler.clear(URI);
        let cleared = next_publication(&mut h.reader).await;
        assert_eq!(cleared["diagnostics"], serde_json::json!([]));
        assert!(h.scheduler.markers(URI).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_script_documents_are_not_analyzed() {
        let h = harness(StaticAnalyzer::new("gci", "AvoidAlias"));
        h.workspace.open("file:///tmp/notes.txt", 1, "gci\n".to_owned());
        h.scheduler.schedule("file:///tmp/notes.txt");
        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(h.analyzer.calls(), 0);
    }
}
