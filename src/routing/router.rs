use super::health::HealthTracker;
use crate::config::SharedConfig;
use crate::db::models::Route;
use crate::db::routes::RouteStore;
use crate::error::AppError;
use std::sync::Arc;

/// Outcome of matching a request's model against the routing table.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub route: Route,
    /// Model name to send upstream.
    pub effective_model: String,
    /// The request named the redirect keyword.
    pub redirected: bool,
}

impl RouteDecision {
    /// Decision for a sibling route picked during fallback.
    pub fn sibling(route: Route) -> Self {
        Self {
            effective_model: route.model.clone(),
            route,
            redirected: false,
        }
    }
}

#[derive(Clone)]
pub struct ModelRouter {
    store: RouteStore,
    config: SharedConfig,
    health: Arc<HealthTracker>,
}

impl ModelRouter {
    pub fn new(store: RouteStore, config: SharedConfig, health: Arc<HealthTracker>) -> Self {
        Self {
            store,
            config,
            health,
        }
    }

    pub fn store(&self) -> &RouteStore {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub async fn route_for(&self, model: &str) -> Result<RouteDecision, AppError> {
        let redirect = self.config.read().await.redirect();
        let not_routed = |_| AppError::ModelNotRouted(model.to_string());

        if redirect.applies_to(model) {
            if let Some(id) = redirect.target_route_id {
                match self.store.get(id).await {
                    Ok(route) if route.enabled => {
                        log::debug!("Redirect {} -> route {} ({})", model, id, route.model);
                        return Ok(RouteDecision {
                            effective_model: route.model.clone(),
                            route,
                            redirected: true,
                        });
                    }
                    Ok(_) => log::warn!("Redirect target route {} is disabled", id),
                    Err(AppError::NotFound(_)) => {
                        log::warn!("Redirect target route {} no longer exists", id)
                    }
                    Err(e) => return Err(e),
                }
            }

            if redirect.target_model.is_empty() {
                return Err(AppError::ModelNotRouted(model.to_string()));
            }
            let route = self
                .store
                .resolve(&redirect.target_model)
                .await
                .map_err(not_routed)?;
            log::debug!("Redirect {} -> {}", model, redirect.target_model);
            return Ok(RouteDecision {
                effective_model: route.model.clone(),
                route,
                redirected: true,
            });
        }

        let route = self.store.resolve(model).await.map_err(not_routed)?;
        let effective_model = if route.pass_client_model {
            model.to_string()
        } else {
            route.model.clone()
        };
        Ok(RouteDecision {
            route,
            effective_model,
            redirected: false,
        })
    }

    /// Enabled route models plus the redirect keyword when redirection is on.
    pub async fn advertised_models(&self) -> Result<Vec<String>, AppError> {
        let mut models = self.store.enabled_models().await?;
        let redirect = self.config.read().await.redirect();
        if redirect.enabled
            && !redirect.keyword.is_empty()
            && !models.iter().any(|m| *m == redirect.keyword)
        {
            models.push(redirect.keyword);
        }
        Ok(models)
    }

    /// Enabled siblings of `route`, ascending by id. Ungrouped routes have none.
    pub async fn siblings(&self, route: &Route) -> Result<Vec<Route>, AppError> {
        if !route.is_grouped() {
            return Ok(Vec::new());
        }
        self.store.group_members(&route.group_name).await
    }
}

/// Next route to try after `origin` failed: ascending id order starting past
/// the origin, wrapping, skipping routes already tried and those whose
/// success rate is below `threshold`.
pub fn next_fallback<'a>(
    members: &'a [Route],
    origin: i64,
    tried: &[i64],
    health: &HealthTracker,
    threshold: f64,
) -> Option<&'a Route> {
    let mut ordered: Vec<&Route> = members.iter().collect();
    ordered.sort_by_key(|r| r.id);
    let start = ordered.iter().position(|r| r.id > origin).unwrap_or(0);

    ordered[start..]
        .iter()
        .chain(ordered[..start].iter())
        .copied()
        .find(|r| {
            r.id != origin
                && r.enabled
                && !tried.contains(&r.id)
                && health.is_healthy(r.id, threshold)
        })
}
