// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use tokio::time::sleep;

/// One-shot deferred execution, used by the server-side read throttle.
pub trait Scheduler: Send + Sync {
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs deferred tasks on the tokio runtime. Must be used from within a
/// runtime context.
#[derive(Debug, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> TokioScheduler {
        TokioScheduler
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) {
        tokio::spawn(async move {
            sleep(delay).await;
            task();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let scheduler = TokioScheduler::new();

        let flag = fired.clone();
        scheduler.after(
            Duration::from_millis(50),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
