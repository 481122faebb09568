use std::{collections::BTreeMap, path::Path};

use kiln_process::Allocation;

const DEFAULT_JARFILE: &str = "server.jar";
const DEFAULT_VERSION: &str = "latest";

fn placeholder(name: &str) -> String {
    format!("{{{{{name}}}}}")
}

/// Substitutes `{{VARNAME}}` placeholders in an invocation template.
///
/// Order matters: each pass replaces every occurrence of its placeholder, so
/// the first pass that knows a name wins. Memory goes first, then caller
/// variables (in key order), then the allocation, then the fixed fallbacks.
pub fn resolve_template(
    template: &str,
    memory_mb: u64,
    variables: &BTreeMap<String, String>,
    allocation: &Allocation,
) -> String {
    let mut out = template.replace(&placeholder("SERVER_MEMORY"), &memory_mb.to_string());

    for (name, value) in variables {
        out = out.replace(&placeholder(name), value);
    }

    out = out
        .replace(&placeholder("SERVER_IP"), &allocation.ip)
        .replace(&placeholder("SERVER_PORT"), &allocation.port.to_string());

    out.replace(&placeholder("SERVER_JARFILE"), DEFAULT_JARFILE)
        .replace(&placeholder("VERSION"), DEFAULT_VERSION)
}

/// Splits a command line into argv with shell-like quoting.
///
/// Quoted spans keep their whitespace; an unterminated quote absorbs the rest
/// of the input.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => cur.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut cur));
                    in_token = false;
                }
            }
            None => {
                cur.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(cur);
    }
    tokens
}

/// The agent's own environment, skipping entries that are not valid UTF-8.
pub fn agent_environment() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Child environment: agent environment, then caller variables, then `HOME`.
pub fn build_environment(
    base: impl IntoIterator<Item = (String, String)>,
    variables: &BTreeMap<String, String>,
    root_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = base.into_iter().collect();
    for (k, v) in variables {
        env.insert(k.clone(), v.clone());
    }
    env.insert("HOME".to_string(), root_dir.display().to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn jarfile_falls_back_to_default() {
        let out = resolve_template(
            "java -Xmx{{SERVER_MEMORY}}M -jar {{SERVER_JARFILE}}",
            1024,
            &BTreeMap::new(),
            &Allocation::default(),
        );
        assert_eq!(out, "java -Xmx1024M -jar server.jar");
    }

    #[test]
    fn caller_variables_beat_fallbacks_but_not_memory() {
        let out = resolve_template(
            "run {{SERVER_MEMORY}} {{SERVER_JARFILE}} {{VERSION}} {{LEVEL}}",
            2048,
            &vars(&[
                ("SERVER_MEMORY", "1"),
                ("SERVER_JARFILE", "paper.jar"),
                ("LEVEL", "world"),
            ]),
            &Allocation::default(),
        );
        assert_eq!(out, "run 2048 paper.jar latest world");
    }

    #[test]
    fn allocation_fills_address_unless_caller_set_it() {
        let allocation = Allocation {
            ip: "10.0.0.5".to_string(),
            port: 25565,
        };
        let out = resolve_template(
            "srv --ip {{SERVER_IP}} --port {{SERVER_PORT}}",
            0,
            &vars(&[("SERVER_PORT", "30000")]),
            &allocation,
        );
        assert_eq!(out, "srv --ip 10.0.0.5 --port 30000");
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let out = resolve_template("echo {{NOPE}}", 0, &BTreeMap::new(), &Allocation::default());
        assert_eq!(out, "echo {{NOPE}}");
    }

    #[test]
    fn tokenize_handles_both_quote_styles() {
        assert_eq!(
            tokenize(r#"start "My Server" --flag 'a b'"#),
            vec!["start", "My Server", "--flag", "a b"]
        );
    }

    #[test]
    fn tokenize_collapses_whitespace() {
        assert_eq!(tokenize("  a \t b\n c  "), vec!["a", "b", "c"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn tokenize_keeps_embedded_quotes_of_other_kind() {
        assert_eq!(
            tokenize(r#"sh -c "echo 'hi there'""#),
            vec!["sh", "-c", "echo 'hi there'"]
        );
    }

    #[test]
    fn tokenize_unterminated_quote_absorbs_rest() {
        assert_eq!(tokenize(r#"say "hello world"#), vec!["say", "hello world"]);
    }

    #[test]
    fn tokenize_keeps_empty_quoted_token() {
        assert_eq!(tokenize(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn environment_layers_in_order() {
        let env = build_environment(
            vec![
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("HOME".to_string(), "/root".to_string()),
                ("EULA".to_string(), "false".to_string()),
            ],
            &vars(&[("EULA", "true"), ("HOME", "/elsewhere")]),
            Path::new("/data/servers/srv1"),
        );
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["EULA"], "true");
        assert_eq!(env["HOME"], "/data/servers/srv1");
    }
}
