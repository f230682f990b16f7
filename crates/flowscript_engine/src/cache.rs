//! Compilation Cache
//!
//! Single-slot cache of one node instance's current artifact. It also
//! remembers the last failed build so a broken definition is not rebuilt on
//! every input, and hands out the generation numbers that tag each artifact's
//! timers.

use std::sync::Arc;

use crate::artifact::{CacheKey, CompiledArtifact};
use crate::error::ScriptError;

/// Result of looking a definition up in the cache
#[derive(Debug)]
pub enum Lookup {
    /// The current artifact was built from this key
    Hit(Arc<CompiledArtifact>),
    /// The last build for this key failed
    Failed(ScriptError),
    /// Nothing cached for this key
    Miss,
}

#[derive(Debug)]
pub struct CompilationCache {
    current: Option<Arc<CompiledArtifact>>,
    failed: Option<(CacheKey, ScriptError)>,
    next_generation: u64,
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationCache {
    pub fn new() -> Self {
        Self {
            current: None,
            failed: None,
            next_generation: 1,
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        if let Some(current) = &self.current {
            if current.key() == *key {
                return Lookup::Hit(current.clone());
            }
        }
        match &self.failed {
            Some((failed, err)) if failed == key => Lookup::Failed(err.clone()),
            _ => Lookup::Miss,
        }
    }

    /// The current artifact, if any
    pub fn current(&self) -> Option<Arc<CompiledArtifact>> {
        self.current.clone()
    }

    /// Install a new artifact, returning the one it replaces
    pub fn install(&mut self, artifact: Arc<CompiledArtifact>) -> Option<Arc<CompiledArtifact>> {
        self.failed = None;
        self.current.replace(artifact)
    }

    /// Remember a failed build; the current artifact stays installed
    pub fn remember_failure(&mut self, key: CacheKey, err: ScriptError) {
        self.failed = Some((key, err));
    }

    /// Empty the slot, returning its artifact
    pub fn take(&mut self) -> Option<Arc<CompiledArtifact>> {
        self.failed = None;
        self.current.take()
    }

    /// Generation for the next build
    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}
