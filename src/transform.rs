// src/transform.rs
//
// Data transforms for filestream drivers. A driver's operations map binds an
// operation name to a transform script - a pipeline of primitive steps
// separated by '|' that turns the bytes read from a watched file into the
// lookup key for that file's intent map, e.g. "utf8 | line | trim | upper".

/// Intermediate value flowing through a transform pipeline.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bytes(Vec<u8>),
    Text(String),
}

impl Value {
    fn into_text(self) -> String {
        match self {
            Value::Text(text) => text,
            Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Value::Text(text) => text.into_bytes(),
            Value::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// Decode bytes as UTF-8 text (lossy).
    Utf8,
    /// Hex-encode bytes, uppercase.
    Hex,
    /// First line of the text.
    Line,
    /// Last line of the text.
    LastLine,
    /// Trim surrounding whitespace.
    Trim,
    Upper,
    Lower,
    /// First n bytes.
    Head(usize),
    /// Last n bytes.
    Tail(usize),
}

impl Step {
    fn apply(&self, value: Value) -> Value {
        match self {
            Step::Utf8 => Value::Text(value.into_text()),
            Step::Hex => Value::Text(hex::encode_upper(value.into_bytes())),
            Step::Line => {
                let text = value.into_text();
                Value::Text(text.lines().next().unwrap_or_default().to_string())
            }
            Step::LastLine => {
                let text = value.into_text();
                Value::Text(text.lines().last().unwrap_or_default().to_string())
            }
            Step::Trim => Value::Text(value.into_text().trim().to_string()),
            Step::Upper => Value::Text(value.into_text().to_uppercase()),
            Step::Lower => Value::Text(value.into_text().to_lowercase()),
            Step::Head(n) => {
                let mut bytes = value.into_bytes();
                bytes.truncate(*n);
                Value::Bytes(bytes)
            }
            Step::Tail(n) => {
                let bytes = value.into_bytes();
                let start = bytes.len().saturating_sub(*n);
                Value::Bytes(bytes[start..].to_vec())
            }
        }
    }
}

/// A parsed transform script.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    steps: Vec<Step>,
}

impl Transform {
    /// Parse a script. Unknown steps and malformed arguments are errors -
    /// a driver with a bad transform should fail loudly at load time, not
    /// silently drop events later.
    pub fn parse(script: &str) -> Result<Transform, String> {
        let mut steps = Vec::new();
        for part in script.split('|') {
            let part = part.trim();
            if part.is_empty() {
                return Err("empty transform step".to_string());
            }
            let mut words = part.split_whitespace();
            let op = words.next().unwrap_or_default();
            let arg = words.next();
            if words.next().is_some() {
                return Err(format!("too many arguments for step '{}'", part));
            }
            let parse_count = |arg: Option<&str>| -> Result<usize, String> {
                arg.ok_or_else(|| format!("step '{}' requires a byte count", op))?
                    .parse::<usize>()
                    .map_err(|e| format!("bad byte count in step '{}': {}", part, e))
            };
            let step = match op {
                "utf8" => Step::Utf8,
                "hex" => Step::Hex,
                "line" => Step::Line,
                "last_line" => Step::LastLine,
                "trim" => Step::Trim,
                "upper" => Step::Upper,
                "lower" => Step::Lower,
                "head" => Step::Head(parse_count(arg)?),
                "tail" => Step::Tail(parse_count(arg)?),
                other => return Err(format!("unknown transform step '{}'", other)),
            };
            if arg.is_some() && !matches!(step, Step::Head(_) | Step::Tail(_)) {
                return Err(format!("step '{}' takes no argument", op));
            }
            steps.push(step);
        }
        if steps.is_empty() {
            return Err("empty transform script".to_string());
        }
        Ok(Transform { steps })
    }

    /// Run the pipeline over raw file bytes, producing the lookup key.
    pub fn apply(&self, data: &[u8]) -> String {
        let mut value = Value::Bytes(data.to_vec());
        for step in &self.steps {
            value = step.apply(value);
        }
        value.into_text()
    }
}
