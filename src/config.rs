use dotenv::dotenv;
use std::env;

/// Reads a required environment variable, naming it in the error.
pub fn handle_var(var_name: &str) -> Result<String, anyhow::Error> {
    env::var(var_name)
        .map_err(|e| anyhow::anyhow!("Error reading environment variable {}: {}", var_name, e))
}

/// Resolves search index credentials.
///
/// Flags win over `ES_USER` / `ES_PASS` (a `.env` file is loaded first).
/// No user at all means an unauthenticated cluster; a user without a
/// password is an error.
pub fn index_credentials(
    user: Option<String>,
    pass: Option<String>,
) -> Result<Option<(String, String)>, anyhow::Error> {
    dotenv().ok();

    let Some(user) = user.or_else(|| env::var("ES_USER").ok()) else {
        log::debug!("no index user configured, sending unauthenticated requests");
        return Ok(None);
    };
    let pass = match pass {
        Some(pass) => pass,
        None => handle_var("ES_PASS")?,
    };
    Ok(Some((user, pass)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_used_as_given() {
        let creds = index_credentials(Some("elastic".into()), Some("changeme".into())).unwrap();
        assert_eq!(creds, Some(("elastic".to_string(), "changeme".to_string())));
    }

    #[test]
    fn missing_variable_is_named_in_the_error() {
        let err = handle_var("ALB_WAF_OPS_SURELY_UNSET").unwrap_err();
        assert!(err.to_string().contains("ALB_WAF_OPS_SURELY_UNSET"));
    }
}
