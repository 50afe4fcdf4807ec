use super::leg::{ImScfSide, Leg, LegId, LegKind};
use crate::{
    error::{BrokerError, ConfigError, Result},
    routing::{RoutingSnapshot, Ruleset},
};

/// Legs of one orchestrated call, from IM-SCF A to IM-SCF B.
///
/// Legs live in an arena and are linked by index. A leg that is spliced out
/// or replaced by a rollback stays in the arena with its old links, so
/// correlation tokens issued for it keep resolving and late messages still
/// find its former neighbours.
#[derive(Debug, Clone)]
pub struct Chain {
    legs: Vec<Leg>,
    a_leg: LegId,
    b_leg: LegId,
}

impl Chain {
    /// Instantiates the chain template of `ruleset`, one leg per service.
    pub fn build(ruleset: &Ruleset, routing: &RoutingSnapshot) -> Result<Self> {
        let mut chain = Self {
            legs: vec![Leg::new(0, LegKind::ImScf(ImScfSide::A))],
            a_leg: 0,
            b_leg: 0,
        };
        let mut last = chain.a_leg;
        for (position, alias) in ruleset.services.iter().enumerate() {
            let id = chain.push_service(alias, position, &ruleset.service_key, routing)?;
            chain.link(last, id);
            last = id;
        }
        if last == chain.a_leg {
            return Err(ConfigError::EmptyRuleset(ruleset.service_key.clone()).into());
        }
        let b = chain.push(LegKind::ImScf(ImScfSide::B));
        chain.link(last, b);
        chain.b_leg = b;
        Ok(chain)
    }

    fn push(&mut self, kind: LegKind) -> LegId {
        let id = self.legs.len();
        self.legs.push(Leg::new(id, kind));
        id
    }

    fn push_service(
        &mut self,
        alias: &str,
        position: usize,
        service_key: &str,
        routing: &RoutingSnapshot,
    ) -> Result<LegId> {
        let unknown = || -> BrokerError {
            ConfigError::UnknownService {
                service_key: service_key.to_string(),
                alias: alias.to_string(),
            }
            .into()
        };
        let service = routing.directory.get(alias).ok_or_else(unknown)?;
        let id = self.legs.len();
        let leg = Leg::application_server(id, service, position)
            .ok_or_else(|| BrokerError::from(ConfigError::NoEndpoints(alias.to_string())))?;
        self.legs.push(leg);
        Ok(id)
    }

    fn link(&mut self, prev: LegId, next: LegId) {
        self.legs[prev].next = Some(next);
        self.legs[next].prev = Some(prev);
    }

    pub fn a(&self) -> LegId {
        self.a_leg
    }

    pub fn b(&self) -> LegId {
        self.b_leg
    }

    pub fn first(&self) -> Option<LegId> {
        self.next(self.a_leg)
    }

    pub fn leg(&self, id: LegId) -> &Leg {
        &self.legs[id]
    }

    pub fn leg_mut(&mut self, id: LegId) -> &mut Leg {
        &mut self.legs[id]
    }

    pub fn get(&self, id: LegId) -> Option<&Leg> {
        self.legs.get(id)
    }

    pub fn next(&self, id: LegId) -> Option<LegId> {
        self.legs.get(id).and_then(|leg| leg.next)
    }

    pub fn prev(&self, id: LegId) -> Option<LegId> {
        self.legs.get(id).and_then(|leg| leg.prev)
    }

    /// Removes `id` from the path, linking its neighbours to each other.
    /// Returns the successor, or `None` when `id` is not an inner leg.
    /// The removed leg keeps its own links.
    pub fn splice(&mut self, id: LegId) -> Option<LegId> {
        if id == self.a_leg || id == self.b_leg {
            return None;
        }
        let prev = self.legs[id].prev?;
        let next = self.legs[id].next?;
        self.link(prev, next);
        Some(next)
    }

    /// Rebuilds everything after `anchor` from the ruleset, with fresh legs
    /// and a fresh IM-SCF B. The services re-derived are those following the
    /// anchor's own slot in the template. IM-SCF anchors are left alone.
    pub fn rollback(&mut self, anchor: LegId, ruleset: &Ruleset, routing: &RoutingSnapshot) -> Result<()> {
        let Some(position) = self.legs[anchor].position() else {
            return Ok(());
        };
        let mut last = anchor;
        for (offset, alias) in ruleset.services_after(position).iter().enumerate() {
            let id = self.push_service(alias, position + 1 + offset, &ruleset.service_key, routing)?;
            self.link(last, id);
            last = id;
        }
        let b = self.push(LegKind::ImScf(ImScfSide::B));
        self.link(last, b);
        self.b_leg = b;
        Ok(())
    }

    /// Leg ids on the live path, A first and B last.
    pub fn path(&self) -> Vec<LegId> {
        let mut path = vec![self.a_leg];
        let mut cursor = self.a_leg;
        while let Some(next) = self.legs[cursor].next {
            if path.len() > self.legs.len() {
                break;
            }
            path.push(next);
            cursor = next;
        }
        path
    }

    /// The path is a single run from A to B with mutually inverse links.
    pub fn is_consistent(&self) -> bool {
        let path = self.path();
        if path.len() > self.legs.len() || path.last() != Some(&self.b_leg) {
            return false;
        }
        if self.legs[self.a_leg].prev.is_some() || self.legs[self.b_leg].next.is_some() {
            return false;
        }
        path.windows(2)
            .all(|w| self.legs[w[0]].next == Some(w[1]) && self.legs[w[1]].prev == Some(w[0]))
    }

    /// Number of legs on the live path, A and B included.
    pub fn path_len(&self) -> usize {
        self.path().len()
    }
}
