use anyhow::{bail, Context};
use serde_json::Value;

pub fn auth(builder: reqwest::RequestBuilder, token: Option<&String>) -> reqwest::RequestBuilder {
    match token {
        Some(t) => builder.bearer_auth(t),
        None => builder,
    }
}

pub fn url(gateway_url: &str, path: &str) -> String {
    format!("{}{}", gateway_url.trim_end_matches('/'), path)
}

pub fn parse_params(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    if !value.is_object() {
        bail!("--params must be a JSON object");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        assert_eq!(url("http://h:8080/", "/stats"), "http://h:8080/stats");
        assert_eq!(url("http://h:8080", "/stats"), "http://h:8080/stats");
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_params("[1]").is_err());
        assert!(parse_params("{").is_err());
    }
}
