/// Turn trailing arguments into config overrides.
///
/// Accepts `--key value`, `--key=value`, and a bare `--flag`, which
/// becomes `"true"`. Dotted keys are passed through untouched.
pub fn parse_overrides(args: &[String]) -> Result<Vec<(String, String)>, String> {
    let mut overrides = Vec::new();
    let mut args = args.iter().peekable();

    while let Some(arg) = args.next() {
        let Some(key) = arg.strip_prefix("--") else {
            return Err(format!(
                "unexpected argument '{}', overrides look like --key value",
                arg
            ));
        };
        if let Some((key, value)) = key.split_once('=') {
            overrides.push((checked_key(key)?, value.to_string()));
            continue;
        }

        let key = checked_key(key)?;
        match args.next_if(|next| !next.starts_with("--")) {
            Some(value) => overrides.push((key, value.clone())),
            None => overrides.push((key, "true".to_string())),
        }
    }
    Ok(overrides)
}

fn checked_key(key: &str) -> Result<String, String> {
    if key.is_empty() {
        return Err("empty override key".to_string());
    }
    Ok(key.to_string())
}

/// Parse one `--env NAME=VALUE` flag.
pub fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn parses_every_form() {
        let parsed = parse_overrides(&args(&[
            "--learning_rate",
            "0.0002",
            "--bf16",
            "--memory=800Gi",
            "--resources.limits.cpu",
            "16",
            "--warmup",
            "-1",
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                pair("learning_rate", "0.0002"),
                pair("bf16", "true"),
                pair("memory", "800Gi"),
                pair("resources.limits.cpu", "16"),
                pair("warmup", "-1"),
            ]
        );
    }

    #[test]
    fn trailing_flag_is_true() {
        assert_eq!(
            parse_overrides(&args(&["--gradient_checkpointing"])).unwrap(),
            vec![pair("gradient_checkpointing", "true")]
        );
    }

    #[test]
    fn rejects_stray_values() {
        assert!(parse_overrides(&args(&["0.1"])).is_err());
        assert!(parse_overrides(&args(&["--", "x"])).is_err());
    }

    #[test]
    fn env_flags_need_a_name() {
        assert_eq!(parse_env("WANDB_PROJECT=grpo").unwrap(), pair("WANDB_PROJECT", "grpo"));
        assert_eq!(parse_env("EMPTY=").unwrap(), pair("EMPTY", ""));
        assert!(parse_env("=x").is_err());
        assert!(parse_env("NOVALUE").is_err());
    }
}
