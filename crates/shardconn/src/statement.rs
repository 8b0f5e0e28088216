//! The statement contract consumed by connections.
//!
//! Statement builders live outside this crate. Anything that can produce
//! statement text and an ordered parameter list can be executed on a
//! [`Connection`](crate::conn::Connection). Statement text is passed to the
//! driver as is.
use std::borrow::Cow;

use crate::value::Value;

/// A buildable SQL statement.
pub trait Statement: Send + Sync {
    /// Statement text, with driver placeholders for parameters.
    fn prepare(&self) -> Cow<'_, str>;

    /// Parameters in placeholder order.
    fn binds(&self) -> Vec<Value>;
}

impl Statement for str {
    fn prepare(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }

    fn binds(&self) -> Vec<Value> {
        Vec::new()
    }
}

impl Statement for String {
    fn prepare(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }

    fn binds(&self) -> Vec<Value> {
        Vec::new()
    }
}

impl<S: Statement + ?Sized> Statement for &S {
    fn prepare(&self) -> Cow<'_, str> {
        (**self).prepare()
    }

    fn binds(&self) -> Vec<Value> {
        (**self).binds()
    }
}

/// A raw statement with explicit binds.
#[derive(Debug, Clone, PartialEq)]
pub struct Raw {
    text: String,
    binds: Vec<Value>,
}

impl Raw {
    pub fn new(text: impl Into<String>) -> Self {
        Raw {
            text: text.into(),
            binds: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.binds.push(value.into());
        self
    }

    pub fn with_binds(text: impl Into<String>, binds: Vec<Value>) -> Self {
        Raw {
            text: text.into(),
            binds,
        }
    }

    pub fn statement(&self) -> &str {
        &self.text
    }
}

impl Statement for Raw {
    fn prepare(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.text)
    }

    fn binds(&self) -> Vec<Value> {
        self.binds.clone()
    }
}

/// A statement that has been checked by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    text: String,
    num_params: usize,
}

impl Prepared {
    pub fn new(text: impl Into<String>, num_params: usize) -> Self {
        Prepared {
            text: text.into(),
            num_params,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Attach parameters, producing an executable statement.
    pub fn bind(&self, binds: Vec<Value>) -> Raw {
        Raw::with_binds(self.text.clone(), binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_binds_in_order() {
        let stmt = Raw::new("INSERT INTO t VALUES ($1, $2)").bind(1).bind("a");
        assert_eq!("INSERT INTO t VALUES ($1, $2)", stmt.prepare());
        assert_eq!(vec![Value::Int(1), Value::from("a")], stmt.binds());
    }

    #[test]
    fn plain_text_has_no_binds() {
        let stmt = "SELECT 1";
        assert_eq!("SELECT 1", Statement::prepare(stmt));
        assert!(Statement::binds(stmt).is_empty());
    }
}
