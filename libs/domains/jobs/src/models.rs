use serde::{Deserialize, Serialize};

/// Mail job discriminator for one-time passcodes.
pub const SEND_OTP: &str = "SEND_OTP";

/// Error string reported for routing keys without a handler.
pub const NOT_IMPLEMENTED: &str = "Handler not implemented";

/// `mail.otp` payload with `type == "SEND_OTP"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOtpJob {
    #[serde(rename = "type")]
    pub kind: String,
    pub to: String,
    pub otp: String,
    /// Why the code was issued (`login`, `signup`, `reset_password`, ...)
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Body of `POST {MAIL_SERVICE_URL}/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Body of `POST {FLOWISE_PROXY_URL}/internal/jobs/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub job_id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusReport {
    pub fn failed(job_id: &str, job_type: &str, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: "failed".to_string(),
            job_type: job_type.to_string(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_otp_optional_fields() {
        let job: SendOtpJob = serde_json::from_value(json!({
            "type": "SEND_OTP",
            "to": "agent@example.com",
            "otp": "123456"
        }))
        .unwrap();
        assert_eq!(job.purpose, None);
        assert_eq!(job.username, None);
    }

    #[test]
    fn test_send_otp_requires_code() {
        let result = serde_json::from_value::<SendOtpJob>(json!({
            "type": "SEND_OTP",
            "to": "agent@example.com"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_status_report_wire_format() {
        let report = JobStatusReport::failed("abc", "llm.batch", NOT_IMPLEMENTED);
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "jobId": "abc",
                "status": "failed",
                "type": "llm.batch",
                "error": "Handler not implemented"
            })
        );
    }
}
