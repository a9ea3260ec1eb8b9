//! The Registry: an immutable, in-memory view of every catalog table,
//! published behind an `ArcSwap` so readers never observe a partial reload
//! (spec §3 "Ownership & lifecycle", §4.1, §9 "Global mutable state").

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::model::{
    EntityDef, PermissionAction, PermissionDef, RelationDef, RuleDef, RuleHook, StateMachineDef,
    WebhookDef, WebhookHook, WorkflowDef,
};

#[derive(Debug, Default)]
pub struct Registry {
    entities: HashMap<String, Arc<EntityDef>>,
    relations: HashMap<String, Arc<RelationDef>>,
    relations_by_source: HashMap<String, Vec<Arc<RelationDef>>>,
    rules_by_entity_hook: HashMap<(String, RuleHookKey), Vec<Arc<RuleDef>>>,
    state_machines: HashMap<(String, String), Arc<StateMachineDef>>,
    workflows: HashMap<String, Arc<WorkflowDef>>,
    workflows_by_trigger: HashMap<(String, String, String), Arc<WorkflowDef>>,
    webhooks_by_entity_hook: HashMap<(String, WebhookHookKey), Vec<Arc<WebhookDef>>>,
    webhooks_by_id: HashMap<String, Arc<WebhookDef>>,
    permissions_by_entity_action: HashMap<(String, PermissionActionKey), Vec<Arc<PermissionDef>>>,
}

type RuleHookKey = u8;
type WebhookHookKey = u8;
type PermissionActionKey = u8;

fn rule_hook_key(hook: RuleHook) -> RuleHookKey {
    hook as u8
}
fn webhook_hook_key(hook: WebhookHook) -> WebhookHookKey {
    hook as u8
}
fn permission_action_key(action: PermissionAction) -> PermissionActionKey {
    action as u8
}

impl Registry {
    pub fn entity(&self, name: &str) -> Option<Arc<EntityDef>> {
        self.entities.get(name).cloned()
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn relation(&self, name: &str) -> Option<Arc<RelationDef>> {
        self.relations.get(name).cloned()
    }

    pub fn relations_for_source(&self, entity: &str) -> Vec<Arc<RelationDef>> {
        self.relations_by_source
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rules_for(&self, entity: &str, hook: RuleHook) -> Vec<Arc<RuleDef>> {
        self.rules_by_entity_hook
            .get(&(entity.to_string(), rule_hook_key(hook)))
            .cloned()
            .unwrap_or_default()
    }

    pub fn state_machine(&self, entity: &str, field: &str) -> Option<Arc<StateMachineDef>> {
        self.state_machines
            .get(&(entity.to_string(), field.to_string()))
            .cloned()
    }

    pub fn state_machines_for(&self, entity: &str) -> Vec<Arc<StateMachineDef>> {
        self.state_machines
            .iter()
            .filter(|((entity_name, _), _)| entity_name == entity)
            .map(|(_, machine)| machine.clone())
            .collect()
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<WorkflowDef>> {
        self.workflows.get(name).cloned()
    }

    pub fn workflow_for_trigger(&self, entity: &str, field: &str, to: &str) -> Option<Arc<WorkflowDef>> {
        self.workflows_by_trigger
            .get(&(entity.to_string(), field.to_string(), to.to_string()))
            .cloned()
    }

    pub fn webhooks_for(&self, entity: &str, hook: WebhookHook) -> Vec<Arc<WebhookDef>> {
        self.webhooks_by_entity_hook
            .get(&(entity.to_string(), webhook_hook_key(hook)))
            .cloned()
            .unwrap_or_default()
    }

    /// Looks a webhook up by its catalog id, for `Action::Webhook`
    /// transitions where the action names a specific webhook rather than
    /// an entity/hook pair.
    pub fn webhook(&self, id: &str) -> Option<Arc<WebhookDef>> {
        self.webhooks_by_id.get(id).cloned()
    }

    pub fn permissions_for(&self, entity: &str, action: PermissionAction) -> Vec<Arc<PermissionDef>> {
        self.permissions_by_entity_action
            .get(&(entity.to_string(), permission_action_key(action)))
            .cloned()
            .unwrap_or_default()
    }
}

/// Builds the derived indexes from the flat catalog rows the Loader
/// fetched, then wraps the result for atomic publication.
pub struct RegistryBuilder {
    entities: Vec<EntityDef>,
    relations: Vec<RelationDef>,
    rules: Vec<RuleDef>,
    state_machines: Vec<StateMachineDef>,
    workflows: Vec<WorkflowDef>,
    webhooks: Vec<WebhookDef>,
    permissions: Vec<PermissionDef>,
}

impl RegistryBuilder {
    pub fn new(
        entities: Vec<EntityDef>,
        relations: Vec<RelationDef>,
        rules: Vec<RuleDef>,
        state_machines: Vec<StateMachineDef>,
        workflows: Vec<WorkflowDef>,
        webhooks: Vec<WebhookDef>,
        permissions: Vec<PermissionDef>,
    ) -> Self {
        Self {
            entities,
            relations,
            rules,
            state_machines,
            workflows,
            webhooks,
            permissions,
        }
    }

    /// Validates referential consistency (spec §4.1: "every relation
    /// endpoint exists; every rule/permission entity exists") before
    /// producing the immutable registry.
    pub fn build(self) -> Result<Registry, String> {
        let mut entities = HashMap::new();
        for entity in self.entities {
            entities.insert(entity.name.clone(), Arc::new(entity));
        }

        let mut relations = HashMap::new();
        let mut relations_by_source: HashMap<String, Vec<Arc<RelationDef>>> = HashMap::new();
        for relation in self.relations {
            if !entities.contains_key(&relation.source) {
                return Err(format!(
                    "relation '{}' references unknown source entity '{}'",
                    relation.name, relation.source
                ));
            }
            if !entities.contains_key(&relation.target) {
                return Err(format!(
                    "relation '{}' references unknown target entity '{}'",
                    relation.name, relation.target
                ));
            }
            let shared = Arc::new(relation);
            relations_by_source
                .entry(shared.source.clone())
                .or_default()
                .push(shared.clone());
            relations.insert(shared.name.clone(), shared);
        }

        let mut rules_by_entity_hook: HashMap<(String, RuleHookKey), Vec<Arc<RuleDef>>> =
            HashMap::new();
        for rule in self.rules {
            if !entities.contains_key(&rule.entity) {
                return Err(format!(
                    "rule '{}' references unknown entity '{}'",
                    rule.id, rule.entity
                ));
            }
            if !rule.active {
                continue;
            }
            rules_by_entity_hook
                .entry((rule.entity.clone(), rule_hook_key(rule.hook)))
                .or_default()
                .push(Arc::new(rule));
        }
        for bucket in rules_by_entity_hook.values_mut() {
            bucket.sort_by_key(|rule| rule.priority);
        }

        let mut state_machines = HashMap::new();
        for machine in self.state_machines {
            if !entities.contains_key(&machine.entity) {
                return Err(format!(
                    "state machine '{}' references unknown entity '{}'",
                    machine.id, machine.entity
                ));
            }
            if !machine.active {
                continue;
            }
            state_machines.insert(
                (machine.entity.clone(), machine.field.clone()),
                Arc::new(machine),
            );
        }

        let mut workflows = HashMap::new();
        let mut workflows_by_trigger = HashMap::new();
        for workflow in self.workflows {
            if !entities.contains_key(&workflow.trigger.entity) {
                return Err(format!(
                    "workflow '{}' references unknown entity '{}'",
                    workflow.name, workflow.trigger.entity
                ));
            }
            if !workflow.active {
                continue;
            }
            let shared = Arc::new(workflow);
            workflows_by_trigger.insert(
                (
                    shared.trigger.entity.clone(),
                    shared.trigger.field.clone(),
                    shared.trigger.to.clone(),
                ),
                shared.clone(),
            );
            workflows.insert(shared.name.clone(), shared);
        }

        let mut webhooks_by_entity_hook: HashMap<(String, WebhookHookKey), Vec<Arc<WebhookDef>>> =
            HashMap::new();
        let mut webhooks_by_id: HashMap<String, Arc<WebhookDef>> = HashMap::new();
        for webhook in self.webhooks {
            if !entities.contains_key(&webhook.entity) {
                return Err(format!(
                    "webhook '{}' references unknown entity '{}'",
                    webhook.id, webhook.entity
                ));
            }
            if !webhook.active {
                continue;
            }
            let shared = Arc::new(webhook);
            webhooks_by_id.insert(shared.id.clone(), shared.clone());
            webhooks_by_entity_hook
                .entry((shared.entity.clone(), webhook_hook_key(shared.hook)))
                .or_default()
                .push(shared);
        }

        let mut permissions_by_entity_action: HashMap<
            (String, PermissionActionKey),
            Vec<Arc<PermissionDef>>,
        > = HashMap::new();
        for permission in self.permissions {
            if !entities.contains_key(&permission.entity) {
                return Err(format!(
                    "permission '{}' references unknown entity '{}'",
                    permission.id, permission.entity
                ));
            }
            permissions_by_entity_action
                .entry((permission.entity.clone(), permission_action_key(permission.action)))
                .or_default()
                .push(Arc::new(permission));
        }

        Ok(Registry {
            entities,
            relations,
            relations_by_source,
            rules_by_entity_hook,
            state_machines,
            workflows,
            workflows_by_trigger,
            webhooks_by_entity_hook,
            webhooks_by_id,
            permissions_by_entity_action,
        })
    }
}

/// Atomically-swapped handle shared across the process. Cloning `Handle`
/// is cheap (one `Arc` bump); holding a `load()` for the duration of a
/// request guarantees a consistent, never-torn view even if a reload
/// publishes concurrently.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<ArcSwap<Registry>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
        }
    }

    pub fn load(&self) -> Arc<Registry> {
        self.inner.load_full()
    }

    pub fn publish(&self, registry: Registry) {
        self.inner.store(Arc::new(registry));
    }
}
