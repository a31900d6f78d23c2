//! Delayed, cancellable shutdown.
//!
//! A [`ShutdownController`] owns a countdown task on the runtime. The task
//! wakes once per tick, warns the guest when the remaining time is at most
//! five minutes or an exact multiple of five minutes, and at the deadline
//! calls back into the [`VirtualMachine`] to power off. Cancelling the token
//! stops the task before its next notice.

use super::guest::{broadcast_bounded, GuestChannel};
use super::machine::VirtualMachine;
use crate::config::ShutdownSettings;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const NOTICE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Message shown when a shutdown is cancelled.
pub const CANCEL_NOTICE: &str = "The system shutdown has been cancelled";

/// Message shown right before powering off.
pub const FINAL_NOTICE: &str = "The system is going down for poweroff now";

/// Countdown message for the given remaining time.
pub fn countdown_notice(remaining: Duration) -> String {
    let minutes = remaining.as_secs() / 60;
    match minutes {
        0 => "The system is going down for poweroff in less than a minute".to_string(),
        1 => "The system is going down for poweroff in 1 minute".to_string(),
        n => format!("The system is going down for poweroff in {} minutes", n),
    }
}

fn should_notify(remaining: Duration) -> bool {
    remaining <= NOTICE_WINDOW || remaining.as_millis() % NOTICE_WINDOW.as_millis() == 0
}

/// A pending delayed shutdown.
#[derive(Debug)]
pub struct ShutdownController {
    id: u64,
    token: CancellationToken,
    deadline: Instant,
}

impl ShutdownController {
    /// Start the countdown for `vm`.
    pub(crate) fn spawn(
        id: u64,
        delay: Duration,
        vm: Weak<VirtualMachine>,
        vm_name: String,
        guest: Option<Arc<dyn GuestChannel>>,
        settings: ShutdownSettings,
    ) -> Self {
        let token = CancellationToken::new();
        let deadline = Instant::now() + delay;
        let countdown = Countdown {
            id,
            deadline,
            token: token.clone(),
            vm,
            vm_name,
            guest,
            settings,
        };
        tokio::spawn(countdown.run());
        Self {
            id,
            token,
            deadline,
        }
    }

    /// Identifier distinguishing this request from later ones.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time left until power-off.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Stop the countdown. Does not notify the guest.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for ShutdownController {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Countdown {
    id: u64,
    deadline: Instant,
    token: CancellationToken,
    vm: Weak<VirtualMachine>,
    vm_name: String,
    guest: Option<Arc<dyn GuestChannel>>,
    settings: ShutdownSettings,
}

impl Countdown {
    async fn notify(&self, message: &str) {
        let Some(guest) = &self.guest else {
            return;
        };
        if let Err(e) =
            broadcast_bounded(guest.as_ref(), &self.vm_name, message, self.settings.notice_timeout)
                .await
        {
            tracing::warn!(vm = %self.vm_name, error = %e, "failed to send shutdown notice");
        }
    }

    async fn run(self) {
        let mut next = Instant::now();
        self.notify(&countdown_notice(self.deadline - next)).await;

        loop {
            next = (next + self.settings.tick).min(self.deadline);
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep_until(next) => {}
            }

            let remaining = self.deadline - next;
            if remaining.is_zero() {
                break;
            }
            if should_notify(remaining) && !self.token.is_cancelled() {
                tracing::debug!(vm = %self.vm_name, remaining = %humantime::format_duration(remaining), "shutdown countdown");
                self.notify(&countdown_notice(remaining)).await;
            }
        }

        if self.token.is_cancelled() {
            return;
        }
        self.notify(FINAL_NOTICE).await;

        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        if let Err(e) = vm.complete_delayed_shutdown(self.id).await {
            tracing::error!(vm = %self.vm_name, error = %e, "delayed shutdown failed");
        }
    }
}
