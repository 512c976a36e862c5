use crate::entity::EntityRef;
use crate::error::Result;
use crate::schema::{EntitySchema, ID_COLUMN};
use crate::session::Session;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Ids to fetch per target type, in first-seen order
#[derive(Debug, Default)]
struct PrefetchPlan {
    targets: BTreeMap<String, Vec<i64>>,
    queued: HashSet<(String, i64)>,
}

impl PrefetchPlan {
    fn push(&mut self, target: &str, id: i64) -> bool {
        if !self.queued.insert((target.to_string(), id)) {
            return false;
        }
        self.targets.entry(target.to_string()).or_default().push(id);
        true
    }
}

impl Session {
    /// Load the targets of a batch's references with one query per target type.
    ///
    /// Only one level deep; fetched targets are not prefetched themselves.
    pub(crate) async fn prefetch(&mut self, schema: &EntitySchema, batch: &[EntityRef]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let default_limit = self.connections().default_prefetch_limit();
        let mut plan = PrefetchPlan::default();

        for property in schema.references().filter(|p| p.prefetch_enabled) {
            let Some(target) = property.reference_target() else {
                continue;
            };
            let target_schema = self.registry().get(target)?;
            let limit = property.prefetch_limit.or(default_limit);

            let mut taken = 0usize;
            for entity in batch {
                if limit.is_some_and(|limit| taken >= limit) {
                    break;
                }
                let id = entity.borrow().value_or_null(&property.name).as_i64();
                let Some(id) = id else {
                    continue;
                };
                if self.mapped(&target_schema, id).is_some() {
                    continue;
                }
                if plan.push(target, id) {
                    taken += 1;
                }
            }
        }

        for (target, ids) in plan.targets {
            let target_schema = self.registry().get(&target)?;
            self.fetch_targets(&target_schema, ids).await?;
        }
        Ok(())
    }

    async fn fetch_targets(&mut self, schema: &Arc<EntitySchema>, ids: Vec<i64>) -> Result<()> {
        tracing::debug!(entity = schema.name(), count = ids.len(), "prefetching references");
        let ids: Vec<Value> = ids.into_iter().map(Value::from).collect();
        let rows = self
            .fetch_rows(schema, |select| select.where_in(ID_COLUMN, ids))
            .await?;
        for row in rows {
            self.hydrate(schema, row)?;
        }
        Ok(())
    }
}
