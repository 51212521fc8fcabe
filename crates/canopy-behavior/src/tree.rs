use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use canopy_types::Keypath;

use crate::{Indexer, Resolver, Validator};

/// Ordered registry of plugins keyed by keypath prefix.
///
/// Prefix lists are kept in lexical order; the controller walks them in
/// reverse, so the deepest registered prefix sees its patches first and the
/// remainder flows up toward the root.
#[derive(Default)]
pub struct BehaviorTree {
    resolvers: HashMap<Keypath, Arc<dyn Resolver>>,
    resolver_keypaths: Vec<Keypath>,
    validators: HashMap<Keypath, Vec<Arc<dyn Validator>>>,
    validator_keypaths: Vec<Keypath>,
    indexers: HashMap<Keypath, HashMap<String, Arc<dyn Indexer>>>,
}

impl BehaviorTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount (or replace) the resolver at `keypath`.
    pub fn add_resolver(&mut self, keypath: Keypath, resolver: Arc<dyn Resolver>) {
        if self.resolvers.insert(keypath.clone(), resolver).is_none() {
            insert_sorted(&mut self.resolver_keypaths, keypath.clone());
        }
        debug!(keypath = %keypath, "mounted resolver");
    }

    pub fn remove_resolver(&mut self, keypath: &Keypath) {
        if self.resolvers.remove(keypath).is_some() {
            self.resolver_keypaths.retain(|kp| kp != keypath);
        }
    }

    /// Mount an additional validator at `keypath`.
    pub fn add_validator(&mut self, keypath: Keypath, validator: Arc<dyn Validator>) {
        let entry = self.validators.entry(keypath.clone()).or_default();
        if entry.is_empty() {
            insert_sorted(&mut self.validator_keypaths, keypath.clone());
        }
        entry.push(validator);
        debug!(keypath = %keypath, "mounted validator");
    }

    /// Drop every validator mounted at `keypath`.
    pub fn remove_validators(&mut self, keypath: &Keypath) {
        if self.validators.remove(keypath).is_some() {
            self.validator_keypaths.retain(|kp| kp != keypath);
        }
    }

    /// Mount (or replace) a named indexer at `keypath`.
    pub fn set_indexer(&mut self, keypath: Keypath, name: String, indexer: Arc<dyn Indexer>) {
        self.indexers.entry(keypath).or_default().insert(name, indexer);
    }

    pub fn indexer(&self, keypath: &Keypath, name: &str) -> Option<Arc<dyn Indexer>> {
        self.indexers.get(keypath)?.get(name).cloned()
    }

    /// Registered resolver prefixes, deepest first.
    pub fn resolvers_deepest_first(&self) -> Vec<(Keypath, Arc<dyn Resolver>)> {
        self.resolver_keypaths
            .iter()
            .rev()
            .map(|kp| (kp.clone(), Arc::clone(&self.resolvers[kp])))
            .collect()
    }

    /// Registered validator prefixes, deepest first.
    pub fn validators_deepest_first(&self) -> Vec<(Keypath, Vec<Arc<dyn Validator>>)> {
        self.validator_keypaths
            .iter()
            .rev()
            .map(|kp| (kp.clone(), self.validators[kp].clone()))
            .collect()
    }

    pub fn has_resolver(&self, keypath: &Keypath) -> bool {
        self.resolvers.contains_key(keypath)
    }
}

fn insert_sorted(list: &mut Vec<Keypath>, keypath: Keypath) {
    let pos = list.partition_point(|kp| kp < &keypath);
    list.insert(pos, keypath);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::LastWriterResolver;
    use crate::validator::Validator;
    use crate::BehaviorResult;
    use canopy_state::MemoryNode;
    use canopy_tx::Tx;

    struct NopValidator;
    impl Validator for NopValidator {
        fn validate_tx(&self, _state: &MemoryNode, _tx: &Tx) -> BehaviorResult<()> {
            Ok(())
        }
    }

    #[test]
    fn resolvers_iterate_deepest_first() {
        let mut tree = BehaviorTree::new();
        tree.add_resolver(Keypath::root(), Arc::new(LastWriterResolver));
        tree.add_resolver(Keypath::from("room"), Arc::new(LastWriterResolver));
        tree.add_resolver(Keypath::from("room/inner"), Arc::new(LastWriterResolver));

        let order: Vec<Keypath> = tree
            .resolvers_deepest_first()
            .into_iter()
            .map(|(kp, _)| kp)
            .collect();
        assert_eq!(
            order,
            vec![Keypath::from("room/inner"), Keypath::from("room"), Keypath::root()]
        );
    }

    #[test]
    fn replacing_a_resolver_keeps_one_entry() {
        let mut tree = BehaviorTree::new();
        tree.add_resolver(Keypath::from("a"), Arc::new(LastWriterResolver));
        tree.add_resolver(Keypath::from("a"), Arc::new(LastWriterResolver));
        assert_eq!(tree.resolvers_deepest_first().len(), 1);
    }

    #[test]
    fn remove_resolver_unregisters_prefix() {
        let mut tree = BehaviorTree::new();
        tree.add_resolver(Keypath::from("a"), Arc::new(LastWriterResolver));
        tree.remove_resolver(&Keypath::from("a"));
        assert!(tree.resolvers_deepest_first().is_empty());
        assert!(!tree.has_resolver(&Keypath::from("a")));
    }

    #[test]
    fn validators_stack_at_one_prefix() {
        let mut tree = BehaviorTree::new();
        tree.add_validator(Keypath::from("room"), Arc::new(NopValidator));
        tree.add_validator(Keypath::from("room"), Arc::new(NopValidator));

        let groups = tree.validators_deepest_first();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);

        tree.remove_validators(&Keypath::from("room"));
        assert!(tree.validators_deepest_first().is_empty());
    }

    #[test]
    fn indexer_lookup_by_name() {
        let mut tree = BehaviorTree::new();
        tree.set_indexer(
            Keypath::from("room"),
            "by-sender".into(),
            Arc::new(crate::KeypathIndexer::new(Keypath::from("sender"))),
        );
        assert!(tree.indexer(&Keypath::from("room"), "by-sender").is_some());
        assert!(tree.indexer(&Keypath::from("room"), "other").is_none());
        assert!(tree.indexer(&Keypath::from("elsewhere"), "by-sender").is_none());
    }
}
