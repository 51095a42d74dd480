//! `${name}` path templating with an explicit macro scope.

use std::collections::BTreeMap;

use crate::errors::SgResult;
use crate::config_error;

/// A set of named values substituted into `${name}` references.
///
/// Scopes are plain values: build one, optionally derive a child with
/// [`MacroScope::with`], and pass it by reference to [`MacroScope::resolve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroScope {
    values: BTreeMap<String, String>,
}

impl MacroScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        self.values.insert(name.into(), value.to_string());
        self
    }

    /// A copy of this scope with one additional macro.
    pub fn with(&self, name: impl Into<String>, value: impl ToString) -> Self {
        let mut child = self.clone();
        child.set(name, value);
        child
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every known macro; any `${...}` left over is an error.
    pub fn resolve(&self, template: &str) -> SgResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| config_error!("Unterminated macro reference in '{}'", template))?;
            let name = &after[..end];
            let value = self
                .values
                .get(name)
                .ok_or_else(|| config_error!("Unable to resolve macro reference '${{{}}}'", name))?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }
}
