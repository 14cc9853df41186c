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

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::network::RpcSession;

/// Broadcast hook: a named list of observers invoked synchronously, in
/// subscription order, outside any session or registry lock. Observers must
/// not block.
pub struct JoinPoint<T: ?Sized> {
    name: &'static str,
    subscribers: RwLock<Vec<Box<dyn Fn(&T) + Send + Sync>>>,
}

impl<T: ?Sized> JoinPoint<T> {
    pub fn new(name: &'static str) -> JoinPoint<T> {
        JoinPoint {
            name,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(observer));
    }

    pub fn execute(&self, arg: &T) {
        for observer in self.subscribers.read().iter() {
            observer(arg);
        }
    }
}

/// Fired after a client session reaches Connected, and during server session
/// construction.
pub static ON_RPC_SESSION_CONNECTED: Lazy<JoinPoint<RpcSession>> =
    Lazy::new(|| JoinPoint::new("rpc.session.connected"));

/// Fired after a session first transitions to Disconnected.
pub static ON_RPC_SESSION_DISCONNECTED: Lazy<JoinPoint<RpcSession>> =
    Lazy::new(|| JoinPoint::new("rpc.session.disconnected"));

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_execute_fans_out_in_order() {
        let point: JoinPoint<u64> = JoinPoint::new("test.point");
        let hits = Arc::new(AtomicUsize::new(0));

        for weight in [1usize, 10] {
            let hits = hits.clone();
            point.subscribe(move |v: &u64| {
                hits.fetch_add(weight * (*v as usize), Ordering::SeqCst);
            });
        }

        point.execute(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 33);
        assert_eq!(point.name(), "test.point");
    }
}
