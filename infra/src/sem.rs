// Copyright (c) 2025 vivo Mobile Communication Co., Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore. The scheduling controller uses one per
/// application thread ("permission to run") and one for itself
/// ("next state is ready"), so these are almost always binary.
#[derive(Debug, Default)]
pub struct Semaphore {
    counter: Mutex<usize>,
    pending: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            counter: Mutex::new(initial),
            pending: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut counter = self.counter.lock();
        while *counter == 0 {
            self.pending.wait(&mut counter);
        }
        *counter -= 1;
    }

    pub fn post(&self) {
        let mut counter = self.counter.lock();
        *counter += 1;
        self.pending.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
    }

    #[test]
    fn wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || sem2.wait());
        sem.post();
        handle.join().unwrap();
    }
}
