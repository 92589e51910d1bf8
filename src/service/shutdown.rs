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

use tokio::sync::broadcast;

/// Listens for the server-wide shutdown broadcast. Every long-lived task (accept loop,
/// connection handlers, websocket sessions, pool monitor) owns one.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once shutdown is signalled. A dropped sender counts as a signal, so a
    /// server that goes away without notifying still releases its tasks.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// Cloneable trigger handed out by the server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub(crate) fn new(notify: broadcast::Sender<()>) -> Self {
        ShutdownHandle { notify }
    }

    pub fn shutdown(&self) {
        // no receivers just means nothing is running yet
        let _ = self.notify.send(());
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_wakes_every_listener() {
        let (tx, _) = broadcast::channel(1);
        let handle = ShutdownHandle::new(tx);
        let mut first = handle.subscribe();
        let mut second = handle.subscribe();
        handle.shutdown();
        first.recv().await;
        second.recv().await;
        assert!(first.is_shutdown());
        assert!(second.is_shutdown());
        // repeated waits return at once
        first.recv().await;
    }
}
