//! Application Load Balancer access log records.
//!
//! One line of an ALB log is a fixed sequence of space separated fields,
//! some of them double quoted. See
//! <https://docs.aws.amazon.com/elasticloadbalancing/latest/application/load-balancer-access-logs.html>.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const ALB_LINE_PATTERN: &str = concat!(
    r#"^(?P<type>[^ ]*) (?P<time>[^ ]*) (?P<elb>[^ ]*) (?P<client>[^ ]*) (?P<target>[^ ]*) "#,
    r#"(?P<request_processing_time>[-.0-9]*) (?P<target_processing_time>[-.0-9]*) (?P<response_processing_time>[-.0-9]*) "#,
    r#"(?P<elb_status_code>-|[0-9]*) (?P<target_status_code>-|[0-9]*) "#,
    r#"(?P<received_bytes>-|[0-9]*) (?P<sent_bytes>-|[0-9]*) "#,
    r#""(?P<request_method>[^ "]*) (?P<request_url>[^"]*) (?P<request_protocol>- |[^ "]*)" "#,
    r#""(?P<user_agent>[^"]*)" (?P<ssl_cipher>[^ ]*) (?P<ssl_protocol>[^ ]*) (?P<target_group_arn>[^ ]*) "#,
    r#""(?P<trace_id>[^"]*)" "(?P<domain_name>[^"]*)" "(?P<chosen_cert_arn>[^"]*)" "#,
    r#"(?P<matched_rule_priority>-|[0-9]*) (?P<request_creation_time>[^ ]*) "#,
    r#""(?P<actions_executed>[^"]*)" "(?P<redirect_url>[^"]*)" "(?P<error_reason>[^"]*)""#,
    r#"(?: "(?P<target_port_list>[^"]*)" "(?P<target_status_code_list>[^"]*)" "#,
    r#""(?P<classification>[^"]*)" "(?P<classification_reason>[^"]*)")?"#,
    r#"(?: .*)?$"#,
);

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ALB_LINE_PATTERN).expect("ALB line pattern is valid"))
}

/// The trailing quoted fields newer load balancers append.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub target_port_list: String,
    pub target_status_code_list: String,
    pub classification: String,
    pub classification_reason: String,
}

/// One parsed access log line. Every field keeps the exact text from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub record_type: String,
    pub time: String,
    pub elb: String,
    pub client: String,
    pub target: String,
    pub request_processing_time: String,
    pub target_processing_time: String,
    pub response_processing_time: String,
    pub elb_status_code: String,
    pub target_status_code: String,
    pub received_bytes: String,
    pub sent_bytes: String,
    pub request_method: String,
    pub request_url: String,
    pub request_protocol: String,
    pub user_agent: String,
    pub ssl_cipher: String,
    pub ssl_protocol: String,
    pub target_group_arn: String,
    pub trace_id: String,
    pub domain_name: String,
    pub chosen_cert_arn: String,
    pub matched_rule_priority: String,
    pub request_creation_time: String,
    pub actions_executed: String,
    pub redirect_url: String,
    pub error_reason: String,
    pub classification: Option<Classification>,
    pub raw: String,
}

/// Parses one log line. Returns `None` when the line does not have the ALB
/// layout or its timestamp is not RFC 3339.
pub fn parse_line(raw: &str) -> Option<LogRecord> {
    let caps = line_regex().captures(raw)?;
    let field = |name: &str| caps.name(name).map_or_else(String::new, |m| m.as_str().to_string());

    let time = field("time");
    let timestamp = parse_timestamp(&time)?;

    let classification = caps.name("classification").map(|_| Classification {
        target_port_list: field("target_port_list"),
        target_status_code_list: field("target_status_code_list"),
        classification: field("classification"),
        classification_reason: field("classification_reason"),
    });

    Some(LogRecord {
        timestamp,
        record_type: field("type"),
        time,
        elb: field("elb"),
        client: field("client"),
        target: field("target"),
        request_processing_time: field("request_processing_time"),
        target_processing_time: field("target_processing_time"),
        response_processing_time: field("response_processing_time"),
        elb_status_code: field("elb_status_code"),
        target_status_code: field("target_status_code"),
        received_bytes: field("received_bytes"),
        sent_bytes: field("sent_bytes"),
        request_method: field("request_method"),
        request_url: field("request_url"),
        request_protocol: field("request_protocol"),
        user_agent: field("user_agent"),
        ssl_cipher: field("ssl_cipher"),
        ssl_protocol: field("ssl_protocol"),
        target_group_arn: field("target_group_arn"),
        trace_id: field("trace_id"),
        domain_name: field("domain_name"),
        chosen_cert_arn: field("chosen_cert_arn"),
        matched_rule_priority: field("matched_rule_priority"),
        request_creation_time: field("request_creation_time"),
        actions_executed: field("actions_executed"),
        redirect_url: field("redirect_url"),
        error_reason: field("error_reason"),
        classification,
        raw: raw.to_string(),
    })
}

/// Parses the timestamps ALB writes (`2024-05-01T10:00:00.123456Z`) and the
/// second precision form older index documents were written with.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

fn dash(s: &str) -> Option<&str> {
    match s {
        "" | "-" => None,
        s => Some(s),
    }
}

impl LogRecord {
    /// Writes the fields back out in ALB layout.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} \"{} {} {}\" \"{}\" {} {} {} \"{}\" \"{}\" \"{}\" {} {} \"{}\" \"{}\" \"{}\"",
            self.record_type,
            self.time,
            self.elb,
            self.client,
            self.target,
            self.request_processing_time,
            self.target_processing_time,
            self.response_processing_time,
            self.elb_status_code,
            self.target_status_code,
            self.received_bytes,
            self.sent_bytes,
            self.request_method,
            self.request_url,
            self.request_protocol,
            self.user_agent,
            self.ssl_cipher,
            self.ssl_protocol,
            self.target_group_arn,
            self.trace_id,
            self.domain_name,
            self.chosen_cert_arn,
            self.matched_rule_priority,
            self.request_creation_time,
            self.actions_executed,
            self.redirect_url,
            self.error_reason,
        );
        if let Some(c) = &self.classification {
            line.push_str(&format!(
                " \"{}\" \"{}\" \"{}\" \"{}\"",
                c.target_port_list, c.target_status_code_list, c.classification, c.classification_reason
            ));
        }
        line
    }

    pub fn request_processing_time(&self) -> Option<f64> {
        dash(&self.request_processing_time).and_then(|s| s.parse().ok())
    }

    pub fn target_processing_time(&self) -> Option<f64> {
        dash(&self.target_processing_time).and_then(|s| s.parse().ok())
    }

    pub fn response_processing_time(&self) -> Option<f64> {
        dash(&self.response_processing_time).and_then(|s| s.parse().ok())
    }

    pub fn elb_status(&self) -> Option<u16> {
        dash(&self.elb_status_code).and_then(|s| s.parse().ok())
    }

    pub fn target_status(&self) -> Option<u16> {
        dash(&self.target_status_code).and_then(|s| s.parse().ok())
    }

    pub fn received(&self) -> Option<u64> {
        dash(&self.received_bytes).and_then(|s| s.parse().ok())
    }

    pub fn sent(&self) -> Option<u64> {
        dash(&self.sent_bytes).and_then(|s| s.parse().ok())
    }

    /// Stable document id, so re-indexing the same line overwrites it.
    pub fn document_id(&self) -> String {
        hex::encode(Sha256::digest(self.raw.as_bytes()))
    }

    /// The search document for this record, shaped like [`index_mapping`].
    pub fn to_document(&self) -> Value {
        let classification = self.classification.as_ref();
        json!({
            "log": {
                "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                "type": self.record_type,
                "elb": self.elb,
                "client": dash(&self.client),
                "target": dash(&self.target),
                "request_processing_time": self.request_processing_time(),
                "target_processing_time": self.target_processing_time(),
                "response_processing_time": self.response_processing_time(),
                "elb_status_code": dash(&self.elb_status_code),
                "target_status_code": dash(&self.target_status_code),
                "received_bytes": self.received(),
                "sent_bytes": self.sent(),
                "elb_request_method": self.request_method,
                "request_url": self.request_url,
                "request_protocol": self.request_protocol.trim_end(),
                "user_agent": self.user_agent,
                "ssl_cipher": dash(&self.ssl_cipher),
                "ssl_protocol": dash(&self.ssl_protocol),
                "target_group_arn": dash(&self.target_group_arn),
                "trace_id": self.trace_id,
                "domain_name": dash(&self.domain_name),
                "chosen_cert_arn": dash(&self.chosen_cert_arn),
                "matched_rule_priority": dash(&self.matched_rule_priority),
                "request_creation_time": parse_timestamp(&self.request_creation_time)
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                "actions_executed": self.actions_executed,
                "redirect_url": dash(&self.redirect_url),
                "error_reason": dash(&self.error_reason),
                "classification": classification.and_then(|c| dash(&c.classification)),
                "classification_reason": classification.and_then(|c| dash(&c.classification_reason)),
            },
            "raw": self.raw,
        })
    }
}

/// Mapping used when the destination index has to be created.
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "log": {
                    "properties": {
                        "timestamp": {"type": "date"},
                        "type": {"type": "keyword"},
                        "elb": {"type": "keyword"},
                        "client": {"type": "keyword"},
                        "target": {"type": "keyword"},
                        "elb_status_code": {"type": "keyword"},
                        "target_status_code": {"type": "keyword"},
                        "request_processing_time": {"type": "float"},
                        "target_processing_time": {"type": "float"},
                        "response_processing_time": {"type": "float"},
                        "received_bytes": {"type": "long"},
                        "sent_bytes": {"type": "long"},
                        "elb_request_method": {"type": "keyword"},
                        "request_url": {"type": "text"},
                        "request_protocol": {"type": "keyword"},
                        "user_agent": {"type": "text"},
                        "ssl_cipher": {"type": "keyword"},
                        "ssl_protocol": {"type": "keyword"},
                        "target_group_arn": {"type": "keyword"},
                        "trace_id": {"type": "keyword"},
                        "domain_name": {"type": "keyword"},
                        "chosen_cert_arn": {"type": "keyword"},
                        "matched_rule_priority": {"type": "keyword"},
                        "request_creation_time": {"type": "date"},
                        "actions_executed": {"type": "keyword"},
                        "redirect_url": {"type": "text"},
                        "error_reason": {"type": "text"},
                        "classification": {"type": "keyword"},
                        "classification_reason": {"type": "keyword"}
                    }
                },
                "raw": {"type": "text", "index": false}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTTP_LINE: &str = r#"http 2018-07-02T22:23:00.186641Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.000 0.001 0.000 200 200 34 366 "GET http://www.example.com:80/ HTTP/1.1" "curl/7.46.0" - - arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 "Root=1-58337262-36d228ad5d99923122bbe354" "-" "-" 0 2018-07-02T22:22:48.364000Z "forward" "-" "-" "10.0.0.1:80" "200" "-" "-""#;

    const HTTPS_LINE: &str = r#"https 2018-07-02T22:23:00.186641Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.086 0.048 0.037 200 200 0 57 "GET https://www.example.com:443/ HTTP/1.1" "curl/7.46.0" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 "Root=1-58337281-1d84f3d73c47ec4e58577259" "www.example.com" "arn:aws:acm:us-east-2:123456789012:certificate/12345678-1234-1234-1234-123456789012" 1 2018-07-02T22:22:48.364000Z "authenticate,forward" "-" "-""#;

    const FAILED_LINE: &str = r#"http 2018-11-30T22:22:48.364000Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 - -1 -1 -1 400 - 0 0 "- - - " "-" - - - "-" "-" "-" - 2018-11-30T22:22:48.364000Z "-" "-" "-" "-" "-" "-" "-""#;

    #[test]
    fn parses_an_http_line() {
        let record = parse_line(HTTP_LINE).unwrap();

        assert_eq!(record.record_type, "http");
        assert_eq!(
            record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "2018-07-02T22:23:00.186641Z"
        );
        assert_eq!(record.client, "192.168.131.39:2817");
        assert_eq!(record.request_method, "GET");
        assert_eq!(record.request_url, "http://www.example.com:80/");
        assert_eq!(record.request_protocol, "HTTP/1.1");
        assert_eq!(record.user_agent, "curl/7.46.0");
        assert_eq!(record.trace_id, "Root=1-58337262-36d228ad5d99923122bbe354");
        assert_eq!(record.actions_executed, "forward");
        assert_eq!(record.elb_status(), Some(200));
        assert_eq!(record.target_processing_time(), Some(0.001));
        assert_eq!(record.sent(), Some(366));
        assert_eq!(
            record.classification.as_ref().unwrap().target_port_list,
            "10.0.0.1:80"
        );
    }

    #[test]
    fn parses_tls_fields_without_the_trailing_group() {
        let record = parse_line(HTTPS_LINE).unwrap();

        assert_eq!(record.ssl_cipher, "ECDHE-RSA-AES128-GCM-SHA256");
        assert_eq!(record.ssl_protocol, "TLSv1.2");
        assert_eq!(record.domain_name, "www.example.com");
        assert_eq!(record.matched_rule_priority, "1");
        assert_eq!(record.actions_executed, "authenticate,forward");
        assert!(record.classification.is_none());
    }

    #[test]
    fn dashes_read_as_absent() {
        let record = parse_line(FAILED_LINE).unwrap();

        assert_eq!(record.target, "-");
        assert_eq!(record.target_status(), None);
        assert_eq!(record.request_processing_time(), Some(-1.0));
        assert_eq!(record.elb_status(), Some(400));

        let doc = record.to_document();
        assert!(doc["log"]["target"].is_null());
        assert!(doc["log"]["target_status_code"].is_null());
    }

    #[test]
    fn fields_survive_reserialization() {
        for line in [HTTP_LINE, HTTPS_LINE, FAILED_LINE] {
            let record = parse_line(line).unwrap();
            assert_eq!(record.to_line(), line);
            assert_eq!(parse_line(&record.to_line()).unwrap(), record);
        }
    }

    #[test]
    fn tolerates_fields_appended_by_newer_formats() {
        let line = format!("{} \"TID_1234\"", HTTP_LINE);
        let record = parse_line(&line).unwrap();

        assert_eq!(record.to_line(), HTTP_LINE);
        assert_eq!(record.raw, line);
    }

    #[test]
    fn rejects_lines_without_the_alb_layout() {
        assert!(parse_line("").is_none());
        assert!(parse_line("hello world").is_none());
        assert!(parse_line(&HTTP_LINE[..120]).is_none());
        assert!(parse_line(&HTTP_LINE.replace("2018-07-02T22:23:00.186641Z", "yesterday")).is_none());
    }

    #[test]
    fn document_ids_depend_only_on_the_line() {
        let a = parse_line(HTTP_LINE).unwrap();
        let b = parse_line(HTTP_LINE).unwrap();
        let c = parse_line(HTTPS_LINE).unwrap();

        assert_eq!(a.document_id(), b.document_id());
        assert_ne!(a.document_id(), c.document_id());
        assert_eq!(a.document_id().len(), 64);
    }

    #[test]
    fn reads_second_precision_timestamps() {
        let t = parse_timestamp("2024-05-01T10:00:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
