//! Home-Context Processor Task
//!
//! The single task that owns all peer and registry mutation. Requests,
//! whether event envelopes from the transport/remote-control shims or
//! client API calls, arrive on one static FIFO channel and are processed
//! strictly in post order; per-peer ordering follows directly from the
//! single queue and single consumer. The loop is multiplexed with the earliest armed
//! open-fallback deadline so timers fire on the home context too.
//!
//! # Usage
//!
//! Spawn the processor as an Embassy task after initializing the global
//! context, alongside integrator tasks draining the collaborator channels:
//!
//! ```rust,no_run
//! use avlark::{processor, AvContextOptions};
//!
//! # async fn example() -> Result<(), avlark::AvError> {
//! avlark::init_av_context(AvContextOptions::default()).await?;
//! // spawner.spawn(processor_task()).unwrap();  // wraps processor::run()
//! # Ok(())
//! # }
//! ```

use crate::{HOME_CHANNEL, av_context};
use embassy_futures::select::{Either, select};
use embassy_time::{Instant, Timer};

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => Timer::at(at).await,
        None => core::future::pending::<()>().await,
    }
}

/// Run the home-context processor loop. Never returns.
///
/// [`crate::init_av_context`] must have been called first; until then every
/// received request is dropped with an error log.
pub async fn run() -> ! {
    loop {
        let deadline = match av_context().await {
            Ok(ctx) => ctx.earliest_open_fallback_deadline(),
            Err(_) => None,
        };

        match select(HOME_CHANNEL.receive(), wait_for_deadline(deadline)).await {
            Either::First(request) => match av_context().await {
                Ok(mut ctx) => ctx.process_request(request),
                Err(e) => {
                    defmt::error!("[PROCESSOR] AvContext not initialized: {}", e);
                }
            },
            Either::Second(()) => match av_context().await {
                Ok(mut ctx) => ctx.process_open_fallback(Instant::now()),
                Err(e) => {
                    defmt::error!("[PROCESSOR] AvContext not initialized: {}", e);
                }
            },
        }
    }
}
