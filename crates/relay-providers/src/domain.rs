use serde_json::{json, Value};

/// One element of an ERP search domain: a `(field, operator, value)` triple
/// or a prefix logical operator in polish notation.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainItem {
    Triple(String, String, Value),
    And,
    Or,
    Not,
}

/// Typed search-domain expression, serialized to the ERP's list form:
/// triples become `[field, op, value]`, operators become `"&"`, `"|"`, `"!"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Domain {
    items: Vec<DomainItem>,
}

impl Domain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(field: &str, op: &str, value: impl Into<Value>) -> Self {
        Self::new().and_filter(field, op, value)
    }

    pub fn and_filter(mut self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.items
            .push(DomainItem::Triple(field.to_string(), op.to_string(), value.into()));
        self
    }

    /// Prefix an OR over the next two terms.
    pub fn or(mut self) -> Self {
        self.items.push(DomainItem::Or);
        self
    }

    pub fn not(mut self) -> Self {
        self.items.push(DomainItem::Not);
        self
    }

    pub fn push(&mut self, item: DomainItem) {
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[DomainItem] {
        &self.items
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.items
                .iter()
                .map(|item| match item {
                    DomainItem::Triple(f, op, v) => json!([f, op, v]),
                    DomainItem::And => Value::String("&".to_string()),
                    DomainItem::Or => Value::String("|".to_string()),
                    DomainItem::Not => Value::String("!".to_string()),
                })
                .collect(),
        )
    }

    /// Parse the list form back into a typed domain. Unknown shapes are
    /// rejected rather than silently dropped.
    pub fn from_json(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        let mut domain = Domain::new();
        for item in arr {
            match item {
                Value::String(s) => match s.as_str() {
                    "&" => domain.items.push(DomainItem::And),
                    "|" => domain.items.push(DomainItem::Or),
                    "!" => domain.items.push(DomainItem::Not),
                    _ => return None,
                },
                Value::Array(triple) if triple.len() == 3 => {
                    let field = triple[0].as_str()?;
                    let op = triple[1].as_str()?;
                    domain.items.push(DomainItem::Triple(
                        field.to_string(),
                        op.to_string(),
                        triple[2].clone(),
                    ));
                }
                _ => return None,
            }
        }
        Some(domain)
    }
}

/// Extract the id from a many-to-one value, which the ERP returns either as
/// a bare id or as a `[id, display_name]` pair.
pub fn id_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Array(pair) if !pair.is_empty() => pair[0].as_i64(),
        _ => None,
    }
}

/// Extract the display name from a many-to-one `[id, display_name]` pair,
/// or pass a plain string through.
pub fn display_name_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(pair) if pair.len() >= 2 => pair[1].as_str(),
        _ => None,
    }
}
