use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::Jid;

use super::subscription::NodeSubscription;

pub type VecIndex<K> = HashMap<K, Vec<String>>;

/// Subscriptions of one node, indexed by id and by delivery address.
///
/// Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<NodeSubscription>", into = "Vec<NodeSubscription>")]
pub struct SubscriptionIndex {
    by_id: HashMap<String, NodeSubscription>,
    by_jid: VecIndex<Jid>,
    order: Vec<String>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Inserts or replaces a subscription by id.
    pub fn insert(&mut self, sub: NodeSubscription) {
        if let Some(prev) = self.by_id.get(&sub.id) {
            let prev_jid = prev.jid.clone();
            remove_from_index(&mut self.by_jid, &prev_jid, &sub.id);
        } else {
            self.order.push(sub.id.clone());
        }
        self.by_jid
            .entry(sub.jid.clone())
            .or_default()
            .push(sub.id.clone());
        self.by_id.insert(sub.id.clone(), sub);
    }

    /// Removes a subscription from both indexes.
    pub fn remove(&mut self, id: &str) -> Option<NodeSubscription> {
        let sub = self.by_id.remove(id)?;
        remove_from_index(&mut self.by_jid, &sub.jid, id);
        self.order.retain(|v| v != id);
        Some(sub)
    }

    pub fn get(&self, id: &str) -> Option<&NodeSubscription> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeSubscription> {
        self.by_id.get_mut(id)
    }

    /// Subscriptions delivering to `jid`, in insertion order.
    pub fn by_jid(&self, jid: &Jid) -> Vec<&NodeSubscription> {
        self.by_jid
            .get(jid)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    /// Subscriptions owned by `owner`, in insertion order.
    pub fn owned_by(&self, owner: &Jid) -> Vec<&NodeSubscription> {
        self.iter().filter(|s| s.owner == *owner).collect()
    }

    /// Ids of the subscriptions owned by `owner`.
    pub fn ids_owned_by(&self, owner: &Jid) -> Vec<String> {
        self.iter()
            .filter(|s| s.owner == *owner)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeSubscription> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_jid.clear();
        self.order.clear();
    }
}

fn remove_from_index(index: &mut VecIndex<Jid>, jid: &Jid, id: &str) {
    if let Some(ids) = index.get_mut(jid) {
        ids.retain(|v| v != id);
        if ids.is_empty() {
            index.remove(jid);
        }
    }
}

impl From<Vec<NodeSubscription>> for SubscriptionIndex {
    fn from(subs: Vec<NodeSubscription>) -> Self {
        let mut index = Self::new();
        for sub in subs {
            index.insert(sub);
        }
        index
    }
}

impl From<SubscriptionIndex> for Vec<NodeSubscription> {
    fn from(mut index: SubscriptionIndex) -> Self {
        let order = std::mem::take(&mut index.order);
        order
            .into_iter()
            .filter_map(|id| index.by_id.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::subscription::SubscriptionState,
        types::{NodeIdentity, ServiceId},
    };

    fn sub(jid: &str) -> NodeSubscription {
        let jid = Jid::new(jid);
        NodeSubscription::new(
            NodeIdentity::new(ServiceId::new("svc"), "n"),
            jid.bare(),
            jid,
            SubscriptionState::Subscribed,
        )
    }

    #[test]
    fn remove_clears_both_indexes() {
        let mut index = SubscriptionIndex::new();
        let a = sub("u@x/a");
        let b = sub("u@x/a");
        let a_id = a.id.clone();
        index.insert(a);
        index.insert(b.clone());

        assert_eq!(index.by_jid(&Jid::new("u@x/a")).len(), 2);
        assert!(index.remove(&a_id).is_some());
        assert!(index.get(&a_id).is_none());
        let left: Vec<_> = index.by_jid(&Jid::new("u@x/a")).into_iter().map(|s| s.id.clone()).collect();
        assert_eq!(left, vec![b.id]);
        assert_eq!(index.owned_by(&Jid::new("u@x")).len(), 1);
    }

    #[test]
    fn order_survives_serde() {
        let mut index = SubscriptionIndex::new();
        for jid in ["a@x", "b@x", "c@x"] {
            index.insert(sub(jid));
        }
        let json = serde_json::to_string(&index).expect("encode");
        let back: SubscriptionIndex = serde_json::from_str(&json).expect("decode");
        let ids: Vec<_> = back.iter().map(|s| s.jid.to_string()).collect();
        assert_eq!(ids, vec!["a@x", "b@x", "c@x"]);
    }
}
