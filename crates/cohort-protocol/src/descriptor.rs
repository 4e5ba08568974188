/// Group descriptors: what a node brings to a group it connects to.
///
/// A descriptor names the group and carries the application's supervisor
/// and follower role factories plus the fitness callbacks used by election
/// and fitness-driven split.
use std::fmt;
use std::sync::Arc;

use crate::error::CohortError;
use crate::roles::Role;
use crate::types::GroupName;

/// Application-supplied fitness callbacks.
///
/// Only `supervisor_fitness` is required. The split callbacks default to
/// [`CohortError::NotImplemented`] so a split that needs them fails fast.
pub trait FitnessFunctions: Send + Sync {
    /// Higher wins the supervisor election.
    fn supervisor_fitness(&self) -> f64;

    fn integer_split_fitness(&self) -> Result<i64, CohortError> {
        Err(CohortError::NotImplemented {
            callback: "integer_split_fitness",
        })
    }

    fn boolean_split_fitness(&self) -> Result<bool, CohortError> {
        Err(CohortError::NotImplemented {
            callback: "boolean_split_fitness",
        })
    }
}

/// Constant supervisor fitness, no split callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantFitness(pub f64);

impl FitnessFunctions for ConstantFitness {
    fn supervisor_fitness(&self) -> f64 {
        self.0
    }
}

type RoleFactory = Arc<dyn Fn() -> Box<dyn Role> + Send + Sync>;

/// A named role factory. A fresh role instance is built on every activation.
#[derive(Clone)]
pub struct RoleSpec {
    id: String,
    factory: RoleFactory,
}

impl RoleSpec {
    pub fn new<F, R>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Role + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Role>),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Role> {
        (self.factory)()
    }
}

impl fmt::Debug for RoleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleSpec").field("id", &self.id).finish()
    }
}

/// Everything a node needs to take part in one group.
#[derive(Clone)]
pub struct GroupDescriptor {
    pub name: GroupName,
    pub supervisor_role: Option<RoleSpec>,
    pub follower_role: Option<RoleSpec>,
    pub fitness: Arc<dyn FitnessFunctions>,
}

impl GroupDescriptor {
    /// A descriptor with no roles and zero supervisor fitness.
    pub fn new(name: impl Into<GroupName>) -> Self {
        Self {
            name: name.into(),
            supervisor_role: None,
            follower_role: None,
            fitness: Arc::new(ConstantFitness(0.0)),
        }
    }

    pub fn with_supervisor_role(mut self, role: RoleSpec) -> Self {
        self.supervisor_role = Some(role);
        self
    }

    pub fn with_follower_role(mut self, role: RoleSpec) -> Self {
        self.follower_role = Some(role);
        self
    }

    pub fn with_fitness(mut self, fitness: impl FitnessFunctions + 'static) -> Self {
        self.fitness = Arc::new(fitness);
        self
    }

    pub fn can_supervise(&self) -> bool {
        self.supervisor_role.is_some()
    }

    pub fn can_follow(&self) -> bool {
        self.follower_role.is_some()
    }

    /// Same roles and fitness under another group name.
    ///
    /// Used when migrating into a group the node has no registered
    /// descriptor for.
    pub fn renamed(&self, name: GroupName) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }
}

impl fmt::Debug for GroupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupDescriptor")
            .field("name", &self.name)
            .field("supervisor_role", &self.supervisor_role)
            .field("follower_role", &self.follower_role)
            .field("fitness", &self.fitness.supervisor_fitness())
            .finish()
    }
}
