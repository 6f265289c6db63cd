//! Template Renderer - Personalizes message templates for a customer

use super::window::calendar_days_between;
use chrono::{DateTime, Utc};
use comanda_storage::models::{Customer, MessageTemplate, Tenant};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use tracing::warn;

/// `{{ name }}` placeholders; dotted names are accepted and render empty
const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([a-z_][a-z0-9_.]*)\s*\}\}";

/// Value used for `days_since_last_visit` when the customer never visited
pub const NEVER_VISITED: &str = "many";

/// Rendered subject/body plus the variables the template referenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
    pub variables: BTreeMap<String, String>,
}

/// Template renderer for personalizing message content
pub struct TemplateRenderer {
    placeholder: Regex,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a new template renderer
    pub fn new() -> Self {
        Self {
            placeholder: Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"),
        }
    }

    /// Every variable available to templates for this customer
    pub fn variables(
        customer: &Customer,
        tenant: &Tenant,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let days_since_last_visit = customer
            .last_visit_at
            .map(|last| calendar_days_between(last, now, tenant.offset()).to_string())
            .unwrap_or_else(|| NEVER_VISITED.to_string());

        BTreeMap::from([
            ("first_name".to_string(), customer.first_name.clone()),
            (
                "last_name".to_string(),
                customer.last_name.clone().unwrap_or_default(),
            ),
            ("name".to_string(), customer.full_name()),
            ("restaurant_name".to_string(), tenant.name.clone()),
            ("total_visits".to_string(), customer.total_visits.to_string()),
            (
                "total_spent".to_string(),
                format!("{:.2}", customer.total_spent),
            ),
            ("days_since_last_visit".to_string(), days_since_last_visit),
            ("segment".to_string(), customer.segment.to_string()),
            ("email".to_string(), customer.email.clone().unwrap_or_default()),
            ("phone".to_string(), customer.phone.clone().unwrap_or_default()),
        ])
    }

    /// Render a template's subject and body for a customer.
    ///
    /// Never fails: a malformed text is returned unrendered.
    pub fn render(
        &self,
        template: &MessageTemplate,
        customer: &Customer,
        tenant: &Tenant,
        now: DateTime<Utc>,
    ) -> RenderedMessage {
        let values = Self::variables(customer, tenant, now);
        let mut used = BTreeMap::new();

        let body = self
            .render_text(&template.body, &values, &mut used)
            .unwrap_or_else(|| {
                warn!(template_id = %template.id, "Malformed template body, sending raw text");
                template.body.clone()
            });

        let subject = template.subject.as_ref().map(|subject| {
            self.render_text(subject, &values, &mut used)
                .unwrap_or_else(|| {
                    warn!(template_id = %template.id, "Malformed template subject, sending raw text");
                    subject.clone()
                })
        });

        RenderedMessage {
            subject,
            body,
            variables: used,
        }
    }

    /// Substitute placeholders; `None` when an opening `{{` is left unmatched
    fn render_text(
        &self,
        text: &str,
        values: &BTreeMap<String, String>,
        used: &mut BTreeMap<String, String>,
    ) -> Option<String> {
        if self.placeholder.replace_all(text, "").contains("{{") {
            return None;
        }

        let rendered = self.placeholder.replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            let value = values.get(name).cloned().unwrap_or_default();
            used.insert(name.to_string(), value.clone());
            value
        });

        Some(rendered.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use comanda_storage::fixtures;
    use comanda_storage::models::Channel;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 13, 0, 0).unwrap()
    }

    fn setup(body: &str) -> (MessageTemplate, Customer, Tenant) {
        let tenant = fixtures::tenant("La Parrilla");
        let mut customer = fixtures::customer(tenant.id, "Ana");
        customer.last_name = Some("Gómez".to_string());
        customer.total_visits = 7;
        customer.total_spent = 312.5;
        customer.last_visit_at = Some(now() - Duration::days(12));
        let template = fixtures::template(tenant.id, Channel::Whatsapp, body);
        (template, customer, tenant)
    }

    #[test]
    fn test_render_basic_template() {
        let renderer = TemplateRenderer::new();
        let (template, customer, tenant) =
            setup("Hola {{first_name}}, hace {{ days_since_last_visit }} días que no venís a {{restaurant_name}}");

        let rendered = renderer.render(&template, &customer, &tenant, now());
        assert_eq!(
            rendered.body,
            "Hola Ana, hace 12 días que no venís a La Parrilla"
        );
        assert_eq!(rendered.variables.get("first_name").map(String::as_str), Some("Ana"));
        assert_eq!(
            rendered.variables.get("days_since_last_visit").map(String::as_str),
            Some("12")
        );
        assert!(!rendered.variables.contains_key("email"));
    }

    #[test]
    fn test_render_is_idempotent() {
        let renderer = TemplateRenderer::new();
        let (template, customer, tenant) = setup("{{first_name}}: {{days_since_last_visit}}");

        let first = renderer.render(&template, &customer, &tenant, now());
        let second = renderer.render(&template, &customer, &tenant, now());
        assert_eq!(first, second);
        assert_eq!(first.body, "Ana: 12");
    }

    #[test]
    fn test_render_formats_stats() {
        let renderer = TemplateRenderer::new();
        let (template, mut customer, tenant) =
            setup("{{name}} · {{total_visits}} visitas · ${{total_spent}} · {{days_since_last_visit}}");
        customer.last_visit_at = None;

        let rendered = renderer.render(&template, &customer, &tenant, now());
        assert_eq!(rendered.body, "Ana Gómez · 7 visitas · $312.50 · many");
    }

    #[test]
    fn test_render_removes_unknown() {
        let renderer = TemplateRenderer::new();
        let (template, customer, tenant) = setup("Hola {{first_name}}{{coupon_code}}!");

        let rendered = renderer.render(&template, &customer, &tenant, now());
        assert_eq!(rendered.body, "Hola Ana!");
    }

    #[test]
    fn test_malformed_template_falls_back_to_raw() {
        let renderer = TemplateRenderer::new();
        let (template, customer, tenant) = setup("Hola {{first_name, te extrañamos");

        let rendered = renderer.render(&template, &customer, &tenant, now());
        assert_eq!(rendered.body, "Hola {{first_name, te extrañamos");
        assert!(rendered.variables.is_empty());
    }

    #[test]
    fn test_render_subject() {
        let renderer = TemplateRenderer::new();
        let (mut template, customer, tenant) = setup("Body");
        template.subject = Some("{{first_name}}, te guardamos una mesa".to_string());

        let rendered = renderer.render(&template, &customer, &tenant, now());
        assert_eq!(
            rendered.subject.as_deref(),
            Some("Ana, te guardamos una mesa")
        );
    }
}
