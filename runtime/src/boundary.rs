//! The coordinator side of every participant call.
//!
//! Each call is bounded by an optional timeout, shielded against panics, and
//! its failure stamped with the participant key, so the protocol code above
//! only ever sees a [`ParticipantResult`].

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use twophase_core::{
    FailureKind, ParticipantFailure, ParticipantFuture, ParticipantKey, ParticipantResult,
    TransactionId, codes,
};

/// Drive one participant call to completion.
///
/// - elapsed timeout: `PARTICIPANT_TIMEOUT` failure of kind `phase`
/// - panic: `PARTICIPANT_PANICKED` failure of kind `phase`
/// - returned failure: passed through with the participant key attached
pub(crate) async fn guarded<T>(
    phase: FailureKind,
    key: &ParticipantKey,
    tx_id: &TransactionId,
    timeout: Option<Duration>,
    call: ParticipantFuture<'_, T>,
) -> ParticipantResult<T> {
    let shielded = AssertUnwindSafe(call).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, shielded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(ParticipantFailure::new(
                    phase,
                    codes::PARTICIPANT_TIMEOUT,
                    format!("no answer within {}ms", limit.as_millis()),
                    tx_id.clone(),
                )
                .with_participant(key.clone()));
            }
        },
        None => shielded.await,
    };

    match outcome {
        Ok(result) => result.map_err(|failure| failure.with_participant(key.clone())),
        Err(payload) => Err(ParticipantFailure::new(
            phase,
            codes::PARTICIPANT_PANICKED,
            panic_message(payload.as_ref()),
            tx_id.clone(),
        )
        .with_participant(key.clone())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "participant panicked".to_string()
    }
}
