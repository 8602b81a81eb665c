use chrono::SecondsFormat;
use minijinja::{Environment, context};

use meter_core::ThresholdCrossing;

use crate::error::DispatchError;
use crate::payload::usage_percentage;

/// Fuel limit for template evaluation.
const FUEL_LIMIT: u64 = 50_000;

// Names carry extensions so only the HTML body is auto-escaped.
const SUBJECT: &str = "subject.txt";
const TEXT: &str = "body.txt";
const HTML: &str = "body.html";

const SUBJECT_TEMPLATE: &str = "{% if exhausted %}You have reached your API quota{% else %}You have used {{ threshold }}% of your API quota{% endif %}";

const TEXT_TEMPLATE: &str = "\
Hello {{ principal }},

{% if exhausted -%}
You have used all {{ limit }} calls in your current window. Further requests are rejected until {{ reset_date }}.
{%- else -%}
You have used {{ usage }} of {{ limit }} calls ({{ percentage }}%). {{ remaining }} calls remain until {{ reset_date }}.
{%- endif %}
";

const HTML_TEMPLATE: &str = "\
<p>Hello {{ principal }},</p>
{% if exhausted -%}
<p>You have used all <strong>{{ limit }}</strong> calls in your current window. Further requests are rejected until {{ reset_date }}.</p>
{%- else -%}
<p>You have used <strong>{{ usage }}</strong> of {{ limit }} calls ({{ percentage }}%). {{ remaining }} calls remain until {{ reset_date }}.</p>
{%- endif %}
";

/// A rendered notification email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Subject, text and HTML templates for threshold emails.
pub struct EmailTemplates {
    env: Environment<'static>,
}

impl EmailTemplates {
    pub fn new() -> Result<Self, DispatchError> {
        let mut env = Environment::new();
        env.set_fuel(Some(FUEL_LIMIT));
        env.add_template(SUBJECT, SUBJECT_TEMPLATE)?;
        env.add_template(TEXT, TEXT_TEMPLATE)?;
        env.add_template(HTML, HTML_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, crossing: &ThresholdCrossing) -> Result<RenderedEmail, DispatchError> {
        let ctx = context! {
            principal => crossing.principal.as_str(),
            threshold => crossing.threshold,
            usage => crossing.usage,
            limit => crossing.limit,
            remaining => crossing.remaining(),
            percentage => usage_percentage(crossing.usage, crossing.limit),
            reset_date => crossing.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            exhausted => crossing.threshold >= 100,
        };
        Ok(RenderedEmail {
            subject: self.env.get_template(SUBJECT)?.render(&ctx)?,
            text: self.env.get_template(TEXT)?.render(&ctx)?,
            html: self.env.get_template(HTML)?.render(&ctx)?,
        })
    }
}
