mod common;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{signed_pdf, Fixture};
use pdf_signature_remover::config::ACCESS_LEVEL_PUBLIC;
use pdf_signature_remover::coordinator::{BatchHandler, RunCoordinator, RunState};
use pdf_signature_remover::delta::DeltaBuffer;
use pdf_signature_remover::models::{Changeset, DeltaTerm, Triple, DOSSIER_STUK, RDF_TYPE};
use pdf_signature_remover::pipeline::SignatureRemover;

/// Wraps the real remover and records how many runs overlap.
struct Observed {
    inner: SignatureRemover,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl BatchHandler for Observed {
    async fn handle(&self, changesets: Vec<Changeset>) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.handle(changesets).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn batch(piece: &str) -> Vec<Changeset> {
    let term = |v: &str| DeltaTerm {
        kind: "uri".into(),
        value: v.into(),
    };
    vec![Changeset {
        inserts: vec![Triple {
            subject: term(piece),
            predicate: term(RDF_TYPE),
            object: term(DOSSIER_STUK),
            graph: None,
        }],
        deletes: vec![],
    }]
}

#[tokio::test]
async fn second_batch_for_in_flight_piece_runs_afterwards() {
    let fx = Fixture::new();
    let file = fx.add_pdf("f1", signed_pdf());
    let piece = fx.add_piece("p1", "Nota", &file, Some(ACCESS_LEVEL_PUBLIC));

    let handler = Arc::new(Observed {
        inner: fx.remover.clone(),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let buffer = Arc::new(DeltaBuffer::new());
    let coordinator = RunCoordinator::new(
        Arc::clone(&buffer),
        handler.clone(),
        Duration::from_millis(50),
    );

    buffer.push(batch(&piece));
    coordinator.trigger();
    buffer.push(batch(&piece));
    coordinator.trigger();
    assert!(matches!(coordinator.state(), RunState::Running { .. }));

    for _ in 0..200 {
        if coordinator.stats().runs_finished == 2 && coordinator.state() == RunState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let stats = coordinator.stats();
    assert_eq!(stats.runs_started, 2);
    assert_eq!(stats.runs_finished, 2);
    assert!(buffer.is_empty());
    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);

    // Both notifications reached the pipeline; only the first had work to do.
    assert_eq!(fx.pieces.main_piece_checks(), 2);
    assert_eq!(fx.pieces.signed_copies_of(&piece).len(), 1);
    assert_eq!(fx.blobs.write_count(), 1);
}
