//! Worker pool for parallel-per-layer stepping.
//!
//! The pool is a runtime resource: it is never part of a network image and is
//! rebuilt whenever a network is constructed or loaded.

use std::fmt;

use crate::error::Result;
#[cfg(feature = "parallel")]
use crate::error::KsetError;

pub struct Runtime {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl Runtime {
    /// Build a pool of `threads` workers.
    ///
    /// Without the `parallel` feature this only records the size.
    pub fn build(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("kset-layer-{i}"))
                .build()
                .map_err(|e| KsetError::Runtime(e.to_string()))?;
            Ok(Self { threads, pool })
        }
        #[cfg(not(feature = "parallel"))]
        {
            Ok(Self { threads })
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `op` inside the pool so rayon iterators use its workers.
    #[cfg(feature = "parallel")]
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// A fresh pool of the same size.
    pub fn rebuild(&self) -> Result<Self> {
        Self::build(self.threads)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("threads", &self.threads)
            .field("parallel", &cfg!(feature = "parallel"))
            .finish()
    }
}
