//! One-shot timers that inject a command into a stage inbox.
//!
//! Timeouts are ordinary commands: neither the queue nor the event wait knows
//! about time.

use crate::pipeline::command::{CommandPacket, Reply};
use crate::pipeline::stage::CommandSender;
use crossbeam_channel::{Sender, after, bounded, select};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A pending timer. Dropping it cancels the timer.
pub struct Timer {
    cancel_tx: Option<Sender<()>>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Sends `timeout()` to `target` once `delay` has passed.
    pub fn start(target: CommandSender, delay: Duration) -> Self {
        Self::with_command(target, delay, Reply::Timeout.to_command())
    }

    /// Sends `command` to `target` once `delay` has passed.
    pub fn with_command(target: CommandSender, delay: Duration, command: CommandPacket) -> Self {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();

        let handle = thread::spawn(move || {
            select! {
                recv(cancel_rx) -> _ => {
                    log::trace!("timer for {}: cancelled", target.stage());
                }
                recv(after(delay)) -> _ => {
                    log::debug!("timer for {}: firing {}", target.stage(), command);
                    fired_flag.store(true, Ordering::SeqCst);
                    target.send_command(command);
                }
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
            fired,
            handle: Some(handle),
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Cancels the timer and waits for its thread.
    ///
    /// Returns true if the command was not sent.
    pub fn cancel(mut self) -> bool {
        self.stop();
        !self.has_fired()
    }

    fn stop(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the thread.
        self.cancel_tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("timer thread panicked");
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::StageContext;

    #[test]
    fn test_timer_fires_timeout_command() {
        let (ctx, _waiter) = StageContext::standalone("target");
        let timer = Timer::start(ctx.commands(), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(100));
        assert!(timer.has_fired());
        drop(timer);

        let packet = ctx.inbox().pop().expect("timeout command queued");
        let command = packet.as_command().unwrap();
        assert_eq!(Reply::from_command(command), Some(Reply::Timeout));
    }

    #[test]
    fn test_timer_cancel_before_firing() {
        let (ctx, waiter) = StageContext::standalone("target");
        let timer = Timer::start(ctx.commands(), Duration::from_secs(10));

        assert!(timer.cancel());
        assert_eq!(waiter.drain(), 0, "no command was delivered");
    }

    #[test]
    fn test_timer_wakes_stage_event_wait() {
        let (ctx, waiter) = StageContext::standalone("target");
        let _timer = Timer::start(ctx.commands(), Duration::from_millis(10));

        assert!(waiter.wait().is_some());
    }

    #[test]
    fn test_cancel_after_firing_reports_false() {
        let (ctx, _waiter) = StageContext::standalone("target");
        let timer = Timer::with_command(
            ctx.commands(),
            Duration::from_millis(1),
            CommandPacket::new("stop", Vec::new()),
        );
        thread::sleep(Duration::from_millis(50));
        assert!(!timer.cancel());
    }
}
