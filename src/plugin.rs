use std::sync::Arc;

/// Read-only snapshot of one ticket handed to a plugin during candidate
/// picking. Index 0 of the array is always the owning ticket; the rest
/// follow the owner's candidate slots, best rating first.
pub struct PluginCandidate<'a> {
    pub global_id: &'a str,
    /// 0 for the owning ticket
    pub rating: f32,
    pub state: &'a [Vec<f32>],
}

/// Optional per-pool hook that can override match size and candidate
/// selection.
///
/// The native-library loading side lives outside this crate; anything
/// registered here just has to uphold the contract:
///  - `match_size` below 2 is ignored
///  - `pick_match_candidates` fills `picked` with indices into
///    `candidates` (never 0, never out of range, no duplicates);
///    a violating or already-consumed pick invalidates the whole match
///  - returning `false` from `pick_match_candidates` means "use the
///    defaults I was given"
pub trait MatchPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Pool this plugin wants; empty string is a catch-all
    fn handled_ticket_pool(&self) -> &str;

    fn match_size(&self, _ticket_count: usize) -> usize {
        0
    }

    fn override_candidate_picking(&self) -> bool {
        false
    }

    fn pick_match_candidates(
        &self,
        _candidates: &[PluginCandidate<'_>],
        _picked: &mut [usize],
    ) -> bool {
        false
    }
}

/// Exactly one plugin is bound to a pool on first sighting
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn MatchPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn MatchPlugin>) {
        self.plugins.push(plugin);
    }

    /// First plugin declaring this exact pool, otherwise the first
    /// catch-all, otherwise none
    pub fn bind_for_pool(&self, pool_id: &str) -> Option<Arc<dyn MatchPlugin>> {
        self.plugins
            .iter()
            .find(|p| p.handled_ticket_pool() == pool_id)
            .or_else(|| self.plugins.iter().find(|p| p.handled_ticket_pool().is_empty()))
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Named(&'static str, &'static str);

    impl MatchPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn handled_ticket_pool(&self) -> &str {
            self.1
        }
    }

    #[test]
    fn exact_pool_beats_catch_all() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("any", "")));
        registry.register(Arc::new(Named("ranked-only", "ranked")));

        assert_eq!(registry.bind_for_pool("ranked").unwrap().name(), "ranked-only");
        assert_eq!(registry.bind_for_pool("casual").unwrap().name(), "any");
    }

    #[test]
    fn no_plugins_binds_nothing() {
        assert!(PluginRegistry::new().bind_for_pool("ranked").is_none());
    }
}
