//! `{{name}}` placeholder rendering for command templates.
//!
//! Only the double-brace form is special, so shell `$VAR`, `${VAR}` and awk
//! `{print $1}` pass through untouched.

use std::collections::BTreeMap;

use thiserror::Error;

pub type Bindings = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unbound template variable '{0}'")]
    Unbound(String),
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

pub fn render(template: &str, bindings: &Bindings) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;
        let name = after[..end].trim();
        let value = bindings
            .get(name)
            .ok_or_else(|| TemplateError::Unbound(name.to_string()))?;
        out.push_str(value);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Placeholder names in order of first appearance. Unterminated placeholders
/// are ignored here; `render` reports them.
pub fn variables(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let name = after[..end].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
        rest = &after[end + 2..];
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_placeholders() {
        let b = bindings(&[("db_name", "ORA1"), ("standby_address", "10.0.0.2")]);
        let out = render("SERVICE=//{{standby_address}}:1521/{{ db_name }}", &b).unwrap();
        assert_eq!(out, "SERVICE=//10.0.0.2:1521/ORA1");
    }

    #[test]
    fn shell_syntax_passes_through() {
        let b = Bindings::new();
        let t = "md5sum $ORACLE_HOME/dbs/x | awk '{print $1}'; echo ${HOME}; SELECT * FROM V$LOG";
        assert_eq!(render(t, &b).unwrap(), t);
    }

    #[test]
    fn unbound_variable_is_an_error() {
        let err = render("x {{orapw_md5}} y", &Bindings::new()).unwrap_err();
        assert_eq!(err, TemplateError::Unbound("orapw_md5".into()));
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let b = bindings(&[("a", "1")]);
        assert_eq!(
            render("{{a}} then {{b", &b).unwrap_err(),
            TemplateError::Unterminated(11)
        );
    }

    #[test]
    fn lists_variables_once() {
        let vars = variables("{{a}} {{b}} {{a}} {{ c }}");
        assert_eq!(vars, vec!["a", "b", "c"]);
    }
}
