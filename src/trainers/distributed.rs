//! Process groups for data-parallel training
//!
//! The coordinator only needs rank, world size, a gradient mean across
//! workers and a barrier. [`SingleProcess`] is the trivial group;
//! [`LocalGroup`] runs several workers as threads of one process.

use candle_core::Tensor;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{FinetuneError, Result};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// The elected coordinating process; the only one that writes files.
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise mean of each named gradient across all workers. Blocks
    /// until every worker has contributed.
    fn all_reduce_mean(&self, grads: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>>;

    fn barrier(&self) -> Result<()>;

    /// Releases peers blocked in a collective after this worker failed.
    fn abort(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, grads: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        Ok(grads)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> FinetuneError {
    FinetuneError::Distributed("barrier lock poisoned".to_string())
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: usize,
    aborted: bool,
}

/// Reusable barrier that fails instead of hanging once any worker aborts.
struct AbortableBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl AbortableBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if state.aborted {
            return Err(FinetuneError::Distributed("a peer worker aborted".to_string()));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self.cvar.wait(state).map_err(poisoned)?;
        }
        if state.generation == generation {
            return Err(FinetuneError::Distributed("a peer worker aborted".to_string()));
        }
        Ok(())
    }

    fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.cvar.notify_all();
    }
}

struct Shared {
    barrier: AbortableBarrier,
    slots: Mutex<Vec<HashMap<String, Tensor>>>,
}

/// One worker's handle on an in-process group of threads.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Handles for every rank of a new group, in rank order.
    pub fn new(world_size: usize) -> Result<Vec<LocalGroup>> {
        if world_size == 0 {
            return Err(FinetuneError::Distributed("world size must be positive".to_string()));
        }
        let shared = Arc::new(Shared {
            barrier: AbortableBarrier::new(world_size),
            slots: Mutex::new(vec![HashMap::new(); world_size]),
        });
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect())
    }

    fn lock_slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<HashMap<String, Tensor>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| FinetuneError::Distributed("a worker panicked during all-reduce".to_string()))
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, grads: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        if self.world_size == 1 {
            return Ok(grads);
        }
        self.lock_slots()?[self.rank] = grads;
        self.shared.barrier.wait()?;

        // Every rank reduces in rank order, so all ranks get identical sums.
        let reduced = {
            let slots = self.lock_slots()?;
            let mut names: Vec<&String> = slots[0].keys().collect();
            names.sort();
            let mut reduced = HashMap::with_capacity(names.len());
            for name in names {
                let mut sum = slots[0][name].clone();
                for (rank, slot) in slots.iter().enumerate().skip(1) {
                    let grad = slot.get(name).ok_or_else(|| {
                        FinetuneError::Distributed(format!("rank {} has no gradient for {}", rank, name))
                    })?;
                    sum = (sum + grad)?;
                }
                reduced.insert(name.clone(), (sum / self.world_size as f64)?);
            }
            if slots.iter().any(|s| s.len() != reduced.len()) {
                return Err(FinetuneError::Distributed(
                    "workers disagree on the trainable parameter set".to_string(),
                ));
            }
            reduced
        };

        self.shared.barrier.wait()?;
        Ok(reduced)
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait()
    }

    fn abort(&self) {
        self.shared.barrier.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn test_local_group_mean() {
        let groups = LocalGroup::new(3).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let mut grads = HashMap::new();
                    let v = g.rank() as f32;
                    grads.insert("w".to_string(), Tensor::new(&[v, 2.0 * v], &Device::Cpu).unwrap());
                    // two rounds to exercise slot reuse
                    let first = g.all_reduce_mean(grads.clone()).unwrap();
                    let second = g.all_reduce_mean(grads).unwrap();
                    g.barrier().unwrap();
                    (
                        first["w"].to_vec1::<f32>().unwrap(),
                        second["w"].to_vec1::<f32>().unwrap(),
                        g.is_main_process(),
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (first, second, _) in &results {
            assert_eq!(first, &vec![1.0, 2.0]);
            assert_eq!(second, &vec![1.0, 2.0]);
        }
        assert_eq!(results.iter().filter(|r| r.2).count(), 1);
    }

    #[test]
    fn test_abort_releases_waiting_peers() {
        let mut groups = LocalGroup::new(2).unwrap();
        let failing = groups.pop().unwrap();
        let waiting = groups.pop().unwrap();
        let handle = thread::spawn(move || waiting.barrier());
        failing.abort();
        assert!(handle.join().unwrap().is_err());
        assert!(failing.barrier().is_err());
    }

    #[test]
    fn test_single_process_is_identity() {
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::new(&[1f32], &Device::Cpu).unwrap());
        let out = SingleProcess.all_reduce_mean(grads).unwrap();
        assert_eq!(out["w"].to_vec1::<f32>().unwrap(), vec![1.0]);
        assert!(SingleProcess.is_main_process());
    }
}
