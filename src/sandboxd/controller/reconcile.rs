/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::sandboxd::clock::Clock;
use crate::sandboxd::config::ControllerConfig;
use crate::sandboxd::controller::error::ControllerError;
use crate::sandboxd::controller::runtime::{ControllerRuntime, ControllerTarget};
use crate::sandboxd::k8s::store::Client;
use crate::sandboxd::observability::tracing::{self, TraceContext};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Execution context shared across reconciliation phases.
///
/// The context exposes the underlying `ControllerRuntime` so controllers can
/// reach the object client, clock and tunables registered with it.
pub struct ReconcileContext<'a> {
    runtime: &'a ControllerRuntime,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(runtime: &'a ControllerRuntime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &'a ControllerRuntime {
        self.runtime
    }

    /// Looks up a dependency that was previously registered with the runtime.
    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.runtime.dependency::<T>()
    }

    pub fn client(&self) -> Result<Arc<Client>, ControllerError> {
        self.dependency::<Client>()
            .ok_or_else(|| ControllerError::Dependency("object client not registered".into()))
    }

    pub fn config(&self) -> Result<Arc<ControllerConfig>, ControllerError> {
        self.dependency::<ControllerConfig>()
            .ok_or_else(|| ControllerError::Dependency("controller config not registered".into()))
    }

    pub fn clock(&self) -> Result<Arc<dyn Clock>, ControllerError> {
        self.dependency::<DependencyHandle<dyn Clock>>()
            .map(|handle| handle.get())
            .ok_or_else(|| ControllerError::Dependency("clock not registered".into()))
    }
}

/// Wrapper that stores an `Arc<T>` while remaining `Sized`, enabling trait-object dependencies.
pub struct DependencyHandle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> DependencyHandle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T: ?Sized> Clone for DependencyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Registers everything the sandbox, warm pool and claim reconcilers expect.
pub fn register_controller_dependencies(
    runtime: &ControllerRuntime,
    client: Client,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
) {
    runtime.register_dependency(Arc::new(client));
    runtime.register_dependency(Arc::new(config));
    runtime.register_dependency(Arc::new(DependencyHandle::new(clock)));
}

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

type FetchResult<D, O, E> = Result<Option<ReconcileData<D, O>>, E>;

/// Result of a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Converged,
    /// Nothing failed but the object must be looked at again later.
    RequeueAfter(Duration),
}

/// Shared reconciliation interface used by the sandbox controllers.
pub trait Reconciler {
    type Desired;
    type Observed;
    type Plan;
    type Error: Error + Send + Sync + 'static;

    /// Returns the logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    /// Fetches the desired spec and observed state. Returning `Ok(None)` indicates
    /// the resource no longer exists and no further work is required.
    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> FetchResult<Self::Desired, Self::Observed, Self::Error>;

    /// Computes the plan needed to align observed state with the desired spec.
    fn diff(
        &self,
        target: &ControllerTarget,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    /// Applies the previously computed plan to drive the system toward convergence.
    fn apply(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
        plan: Self::Plan,
    ) -> Result<ReconcileOutcome, Self::Error>;

    /// Trace context persisted on the desired object, continued by this pass.
    fn trace_parent(&self, _desired: &Self::Desired) -> Option<TraceContext> {
        None
    }

    /// Performs fetch and diff, returning a plan if the object still exists.
    fn reconcile(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<Self::Plan>, Self::Error> {
        if let Some(data) = self.fetch(ctx, target)? {
            let plan = self.diff(target, &data.desired, &data.observed)?;
            Ok(Some(plan))
        } else {
            Ok(None)
        }
    }

    /// Runs the full pipeline under a span parented on the object's persisted
    /// trace context.
    fn reconcile_and_apply(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<ReconcileOutcome, Self::Error> {
        let Some(data) = self.fetch(ctx, target)? else {
            return Ok(ReconcileOutcome::Converged);
        };
        let parent = self.trace_parent(&data.desired);
        tracing::in_span(parent, self.kind(), "reconcile", || {
            let plan = self.diff(target, &data.desired, &data.observed)?;
            self.apply(ctx, target, plan)
        })
    }
}
