use std::sync::OnceLock;

use minijinja::{context, Environment};
use tracing::error;

use crate::models::Scenario;

const ADMIN_TEMPLATE: &str = "admin.html";

/// Templates are compiled once. A `.html` name turns on HTML auto-escaping.
fn templates() -> &'static Environment<'static> {
    static TEMPLATES: OnceLock<Environment<'static>> = OnceLock::new();
    TEMPLATES.get_or_init(|| {
        let mut env = Environment::new();
        if let Err(e) = env.add_template(ADMIN_TEMPLATE, include_str!("../templates/admin.html")) {
            error!("❌ Failed to compile {}: {}", ADMIN_TEMPLATE, e);
        }
        env
    })
}

/// Renders the scenario management page.
pub fn render(scenarios: &[Scenario], active_id: &str, error: Option<&str>) -> Result<String, minijinja::Error> {
    templates()
        .get_template(ADMIN_TEMPLATE)?
        .render(context! { scenarios => scenarios, active_id => active_id, error => error })
}
