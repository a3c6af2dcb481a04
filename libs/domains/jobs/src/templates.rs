//! OTP email rendering.

use crate::error::TemplateError;
use crate::models::{OutgoingMail, SendOtpJob};
use handlebars::Handlebars;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize)]
struct OtpTemplateData<'a> {
    otp: &'a str,
    username: Option<&'a str>,
    logo_url: &'a str,
    show_logo: bool,
    app_name: &'a str,
    headline: &'a str,
}

/// Handlebars renderer for `SEND_OTP` mail.
#[derive(Clone)]
pub struct OtpTemplates {
    handlebars: Arc<Handlebars<'static>>,
    logo_url: Option<String>,
    app_name: String,
}

impl OtpTemplates {
    pub fn new(logo_url: Option<String>, app_name: impl Into<String>) -> Result<Self, TemplateError> {
        let mut handlebars = Handlebars::new();
        handlebars
            .register_template_string("otp_html", OTP_HTML_TEMPLATE)
            .map_err(|e| TemplateError(format!("Failed to register otp_html: {}", e)))?;
        handlebars
            .register_template_string("otp_text", OTP_TEXT_TEMPLATE)
            .map_err(|e| TemplateError(format!("Failed to register otp_text: {}", e)))?;

        Ok(Self {
            handlebars: Arc::new(handlebars),
            logo_url,
            app_name: app_name.into(),
        })
    }

    /// Render the OTP email addressed to `job.to`.
    pub fn render_otp(&self, job: &SendOtpJob) -> Result<OutgoingMail, TemplateError> {
        let headline = headline(job.purpose.as_deref());
        let data = OtpTemplateData {
            otp: &job.otp,
            username: job.username.as_deref().filter(|u| !u.trim().is_empty()),
            logo_url: self.logo_url.as_deref().unwrap_or_default(),
            show_logo: self.logo_url.is_some(),
            app_name: &self.app_name,
            headline,
        };

        debug!(purpose = ?job.purpose, "Rendering OTP email");

        let html = self
            .handlebars
            .render("otp_html", &data)
            .map_err(|e| TemplateError(e.to_string()))?;
        let text = self
            .handlebars
            .render("otp_text", &data)
            .map_err(|e| TemplateError(e.to_string()))?;

        Ok(OutgoingMail {
            to: job.to.clone(),
            subject: format!("{} - {}", self.app_name, headline),
            text,
            html,
        })
    }
}

fn headline(purpose: Option<&str>) -> &'static str {
    match purpose.map(str::to_ascii_lowercase).as_deref() {
        Some("login") | Some("signin") => "Your sign-in code",
        Some("signup") | Some("register") | Some("verify_email") => "Verify your email address",
        Some("reset_password") | Some("password_reset") => "Reset your password",
        _ => "Your verification code",
    }
}

const OTP_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>{{headline}}</title>
</head>
<body style="font-family: Arial, sans-serif; background: #f4f5f7; padding: 24px;">
  <div style="max-width: 480px; margin: 0 auto; background: #ffffff; border-radius: 8px; padding: 32px;">
    {{#if show_logo}}
    <img src="{{logo_url}}" alt="{{app_name}}" style="max-height: 48px; margin-bottom: 24px;">
    {{/if}}
    <h2 style="margin-top: 0;">{{headline}}</h2>
    <p>Hello{{#if username}} {{username}}{{/if}},</p>
    <p>Use the code below to continue. It expires shortly and can only be used once.</p>
    <p style="font-size: 32px; font-weight: bold; letter-spacing: 8px; text-align: center;">{{otp}}</p>
    <p style="color: #6b7280; font-size: 13px;">If you did not request this code, you can ignore this email.</p>
    <p style="color: #6b7280; font-size: 13px;">{{app_name}}</p>
  </div>
</body>
</html>
"#;

// Plain text: triple-stash so names are not HTML-escaped.
const OTP_TEXT_TEMPLATE: &str = r#"{{{headline}}}

Hello{{#if username}} {{{username}}}{{/if}},

Your code is: {{{otp}}}

It expires shortly and can only be used once. If you did not request this code, you can ignore this email.

{{{app_name}}}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn job(purpose: Option<&str>, username: Option<&str>) -> SendOtpJob {
        SendOtpJob {
            kind: "SEND_OTP".to_string(),
            to: "agent@example.com".to_string(),
            otp: "123456".to_string(),
            purpose: purpose.map(String::from),
            username: username.map(String::from),
        }
    }

    #[test]
    fn test_otp_code_appears_verbatim() {
        let templates = OtpTemplates::new(None, "Helpdesk").unwrap();
        let mail = templates.render_otp(&job(Some("login"), Some("Ada"))).unwrap();

        assert_eq!(mail.to, "agent@example.com");
        assert_eq!(mail.subject, "Helpdesk - Your sign-in code");
        assert!(mail.html.contains("123456"));
        assert!(mail.text.contains("Your code is: 123456"));
        assert!(mail.html.contains("Hello Ada,"));
    }

    #[test]
    fn test_logo_only_when_configured() {
        let without = OtpTemplates::new(None, "Helpdesk").unwrap();
        assert!(!without.render_otp(&job(None, None)).unwrap().html.contains("<img"));

        let with = OtpTemplates::new(Some("https://cdn.example.com/logo.png".to_string()), "Helpdesk")
            .unwrap();
        let html = with.render_otp(&job(None, None)).unwrap().html;
        assert!(html.contains(r#"<img src="https://cdn.example.com/logo.png""#));
    }

    #[test]
    fn test_missing_username_greets_generically() {
        let templates = OtpTemplates::new(None, "Helpdesk").unwrap();
        let mail = templates.render_otp(&job(None, Some(" "))).unwrap();
        assert!(mail.text.contains("Hello,"));
        assert_eq!(mail.subject, "Helpdesk - Your verification code");
    }

    #[test]
    fn test_username_is_escaped_in_html() {
        let templates = OtpTemplates::new(None, "Helpdesk").unwrap();
        let mail = templates
            .render_otp(&job(Some("signup"), Some("<script>")))
            .unwrap();
        assert!(!mail.html.contains("<script>"));
        assert!(mail.html.contains("&lt;script&gt;"));
    }
}
