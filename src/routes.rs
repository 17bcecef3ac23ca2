//! Route assembly (§6). Flat `.route(...)` chain in the teacher's `routes.rs` style,
//! with larger feature areas merged in as their own sub-routers.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    alerts, api_keys, audit, cost, drift, extensions, ingestion, instances, rate_limit, scheduled_tasks,
    security, teams, templates, timeseries, users, ws_agent, ws_terminal,
};

async fn root() -> &'static str {
    "ok"
}

async fn healthz() -> &'static str {
    "ok"
}

fn instances_routes() -> Router {
    Router::new()
        .route("/api/v1/instances", get(instances::list_instances).post(instances::register_instance))
        .route(
            "/api/v1/instances/:id",
            get(instances::get_instance).delete(instances::delete_instance),
        )
        .route("/api/v1/instances/:id/suspend", post(instances::suspend_instance))
        .route("/api/v1/instances/:id/resume", post(instances::resume_instance))
        .route("/api/v1/instances/:id/redeploy", post(instances::redeploy_instance))
        .route("/api/v1/instances/:id/clone", post(instances::clone_instance_handler))
        .route("/api/v1/fleet", get(instances::fleet_view_handler))
        .route("/api/v1/instances/:id/metrics", get(timeseries::metrics_handler))
        .route("/api/v1/metrics/timeseries", get(timeseries::fleet_metrics_handler))
        .route("/api/v1/instances/:id/processes", get(ingestion::processes_handler))
        .route(
            "/api/v1/instances/:id/extensions",
            get(extensions::list_instance_extensions_handler).post(extensions::install_handler),
        )
        .route(
            "/api/v1/instances/:id/extensions/:slug",
            axum::routing::delete(extensions::uninstall_handler),
        )
        .route("/api/v1/instances/:id/events", get(ingestion::events_handler))
        .route("/api/v1/instances/:id/heartbeats", get(ingestion::heartbeat_handler))
}

fn users_routes() -> Router {
    Router::new()
        .route("/api/v1/users", get(users::list_users).post(users::create_user))
        .route("/api/v1/users/:id", get(users::get_user).delete(users::delete_user))
        .route("/api/v1/users/:id/role", post(users::set_role_handler))
}

fn teams_routes() -> Router {
    Router::new()
        .route("/api/v1/teams", get(teams::list_teams).post(teams::create_team))
        .route("/api/v1/teams/:id", get(teams::get_team))
        .route(
            "/api/v1/teams/:id/members",
            get(teams::list_members).post(teams::add_member_handler),
        )
        .route(
            "/api/v1/teams/:id/members/:user_id",
            axum::routing::delete(teams::remove_member_handler),
        )
}

fn api_keys_routes() -> Router {
    Router::new()
        .route("/api/v1/api-keys", get(api_keys::list_keys_handler).post(api_keys::create_key_handler))
        .route("/api/v1/api-keys/:id", axum::routing::delete(api_keys::revoke_key_handler))
}

fn templates_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/templates",
            get(templates::list_templates_handler).post(templates::create_template_handler),
        )
        .route(
            "/api/v1/templates/:id_or_slug",
            get(templates::get_template_handler).delete(templates::delete_template_handler),
        )
        .route("/api/v1/templates/wizard", post(templates::submit_wizard_handler))
}

fn extensions_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/extensions",
            get(extensions::list_catalog_handler).post(extensions::submit_extension_handler),
        )
        .route("/api/v1/extensions/:id", get(extensions::get_extension_handler))
        .route("/api/v1/extensions/:id/status", post(extensions::set_extension_status_handler))
        .route(
            "/api/v1/extensions/:id/versions",
            get(extensions::list_versions_handler).post(extensions::publish_version_handler),
        )
}

fn alerts_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/alert-rules",
            get(alerts::list_rules_handler).post(alerts::create_rule_handler),
        )
        .route(
            "/api/v1/alert-rules/:id",
            axum::routing::delete(alerts::delete_rule_handler),
        )
        .route("/api/v1/alert-rules/:id/enabled", post(alerts::set_enabled_handler))
        .route("/api/v1/alert-events", get(alerts::list_events_handler))
}

fn budgets_routes() -> Router {
    Router::new()
        .route("/api/v1/cost-entries", post(cost::record_entry_handler))
        .route("/api/v1/cost-totals", get(cost::totals_handler))
        .route(
            "/api/v1/budgets",
            get(cost::list_budgets_handler).post(cost::create_budget_handler),
        )
        .route("/api/v1/cost-recommendations", get(cost::list_recommendations_handler))
}

fn scheduled_tasks_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/scheduled-tasks",
            get(scheduled_tasks::list_tasks_handler).post(scheduled_tasks::create_task_handler),
        )
        .route(
            "/api/v1/scheduled-tasks/:id",
            get(scheduled_tasks::get_task_handler).delete(scheduled_tasks::delete_task_handler),
        )
        .route("/api/v1/scheduled-tasks/:id/status", post(scheduled_tasks::set_status_handler))
        .route(
            "/api/v1/scheduled-tasks/:id/executions",
            get(scheduled_tasks::list_executions_handler),
        )
}

fn drift_routes() -> Router {
    Router::new()
        .route("/api/v1/drift-reports", get(drift::list_reports_handler))
        .route("/api/v1/drift-reports/:id/acknowledge", post(drift::acknowledge_handler))
        .route("/api/v1/drift-reports/:id/suppress", post(drift::suppress_handler))
        .route("/api/v1/drift-reports/:id/remediate", post(drift::remediate_handler))
}

fn security_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/security/instances/:id/sbom",
            get(security::get_sbom_handler).post(security::submit_sbom_handler),
        )
        .route("/api/v1/security/cves", post(security::record_cve_handler))
        .route("/api/v1/security/cves/:id/status", post(security::set_cve_status_handler))
        .route("/api/v1/security/instances/:id/cves", get(security::cves_for_instance_handler))
        .route("/api/v1/security/instances/:id/score", get(security::score_instance_handler))
        .route("/api/v1/security/fleet-score", get(security::fleet_score_handler))
}

fn audit_routes() -> Router {
    Router::new().route("/api/v1/audit", get(audit::query_handler))
}

fn ws_routes() -> Router {
    Router::new()
        .route("/ws/agent", get(ws_agent::handler))
        .route("/ws/terminal/:instance_id", get(ws_terminal::handler))
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .merge(instances_routes())
        .merge(users_routes())
        .merge(teams_routes())
        .merge(api_keys_routes())
        .merge(templates_routes())
        .merge(extensions_routes())
        .merge(alerts_routes())
        .merge(budgets_routes())
        .merge(scheduled_tasks_routes())
        .merge(drift_routes())
        .merge(security_routes())
        .merge(audit_routes())
        .merge(ws_routes())
        .layer(middleware::from_fn(rate_limit::middleware))
}
