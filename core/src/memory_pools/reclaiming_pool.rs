// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{Arc, Weak},
};

use datafusion::{
    common::{resources_datafusion_err, DataFusionError},
    execution::memory_pool::{MemoryPool, MemoryReservation},
};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::errors::ShuffleResult;

/// A memory consumer that can give memory back on request.
pub trait MemoryReclaimer: Send + Sync {
    /// Tries to free about `size` bytes and returns the number of bytes actually freed.
    /// May be called on the thread that is currently using the consumer, including from
    /// inside one of the consumer's own calls into the pool.
    fn reclaim_fixed_size(&self, size: usize) -> ShuffleResult<usize>;
}

/// A fixed-size `MemoryPool` that, when a reservation would exceed the pool, asks its
/// registered reclaimers to free the shortfall and retries once.
///
/// This mirrors a JVM task memory manager that spills other consumers of the same task
/// before refusing an allocation.
pub struct ReclaimingMemoryPool {
    pool_size: usize,
    used: Mutex<usize>,
    reclaimers: Mutex<Vec<Weak<dyn MemoryReclaimer>>>,
}

impl Debug for ReclaimingMemoryPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ReclaimingMemoryPool")
            .field("pool_size", &self.pool_size)
            .field("used", &*self.used.lock())
            .field("reclaimers", &self.reclaimers.lock().len())
            .finish()
    }
}

impl ReclaimingMemoryPool {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            used: Mutex::new(0),
            reclaimers: Mutex::new(vec![]),
        }
    }

    /// Registers a reclaimer. The pool only keeps a weak reference: a reclaimer that
    /// has been dropped is skipped and forgotten.
    pub fn register_reclaimer(&self, reclaimer: &Arc<dyn MemoryReclaimer>) {
        self.reclaimers.lock().push(Arc::downgrade(reclaimer));
    }

    /// Asks the reclaimers, in registration order, for `target` bytes. No pool lock is
    /// held while a reclaimer runs, it is free to shrink its own reservations.
    fn reclaim(&self, target: usize) -> Result<usize, DataFusionError> {
        let reclaimers: Vec<Arc<dyn MemoryReclaimer>> = {
            let mut reclaimers = self.reclaimers.lock();
            reclaimers.retain(|r| r.strong_count() > 0);
            reclaimers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut freed = 0;
        for reclaimer in reclaimers {
            if freed >= target {
                break;
            }
            freed += reclaimer.reclaim_fixed_size(target - freed)?;
        }
        Ok(freed)
    }

    fn try_reserve(&self, additional: usize) -> Option<usize> {
        let mut used = self.used.lock();
        let requested = *used + additional;
        if requested <= self.pool_size {
            *used = requested;
            None
        } else {
            Some(requested - self.pool_size)
        }
    }
}

impl Drop for ReclaimingMemoryPool {
    fn drop(&mut self) {
        let used = *self.used.lock();
        if used != 0 {
            warn!("ReclaimingMemoryPool dropped with {used} bytes still reserved");
        }
    }
}

impl MemoryPool for ReclaimingMemoryPool {
    fn grow(&self, _: &MemoryReservation, additional: usize) {
        *self.used.lock() += additional;
    }

    fn shrink(&self, _: &MemoryReservation, size: usize) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(size);
    }

    fn try_grow(
        &self,
        reservation: &MemoryReservation,
        additional: usize,
    ) -> Result<(), DataFusionError> {
        if additional == 0 {
            return Ok(());
        }
        let Some(shortfall) = self.try_reserve(additional) else {
            return Ok(());
        };

        let freed = self.reclaim(shortfall)?;
        debug!(
            "{} requested {additional} bytes, {shortfall} short, reclaimed {freed}",
            reservation.consumer().name()
        );

        match self.try_reserve(additional) {
            None => Ok(()),
            Some(_) => Err(resources_datafusion_err!(
                "Failed to acquire {} bytes for {}. Reserved: {} of {}",
                additional,
                reservation.consumer().name(),
                self.reserved(),
                self.pool_size
            )),
        }
    }

    fn reserved(&self) -> usize {
        *self.used.lock()
    }
}
