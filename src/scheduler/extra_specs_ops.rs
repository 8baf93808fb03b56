//! Extra spec operators
//!
//! Matches a backend capability value against an extra spec requirement such
//! as `>= 100`, `<in> ssd`, `<is> True` or `<or> a <or> b`. A requirement
//! without a known operator is compared for string equality.

/// Whether `value` satisfies `requirement`
pub fn matches(value: Option<&str>, requirement: Option<&str>) -> bool {
    let Some(requirement) = requirement else {
        return value.is_none();
    };

    let mut words = requirement.split_whitespace();
    let op = words.next();
    let operands: Vec<&str> = words.collect();

    let known = matches!(
        op,
        Some(
            "=" | "<in>"
                | "<is>"
                | "=="
                | "!="
                | ">="
                | "<="
                | "s=="
                | "s!="
                | "s<"
                | "s<="
                | "s>"
                | "s>="
                | "<or>"
        )
    );
    if !known {
        return value == Some(requirement);
    }

    let (Some(op), Some(value)) = (op, value) else {
        return false;
    };

    if op == "<or>" {
        // <or> v1 <or> v2 <or> v3
        return operands
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 0)
            .any(|(_, candidate)| *candidate == value);
    }

    let Some(operand) = operands.first().copied() else {
        return false;
    };

    match op {
        "<in>" => value.contains(operand),
        "<is>" => match (parse_bool(value), parse_bool(operand)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        "s==" => value == operand,
        "s!=" => value != operand,
        "s<" => value < operand,
        "s<=" => value <= operand,
        "s>" => value > operand,
        "s>=" => value >= operand,
        numeric => {
            let (Ok(v), Ok(o)) = (value.trim().parse::<f64>(), operand.parse::<f64>()) else {
                return false;
            };
            match numeric {
                "=" | ">=" => v >= o,
                "==" => v == o,
                "!=" => v != o,
                "<=" => v <= o,
                _ => false,
            }
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" | "t" => Some(true),
        "false" | "0" | "no" | "n" | "off" | "f" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_equality() {
        assert!(matches(Some("lvm"), Some("lvm")));
        assert!(!matches(Some("lvm"), Some("ceph")));
        assert!(matches(None, None));
        assert!(!matches(Some("x"), None));
        assert!(!matches(None, Some("x")));
    }

    #[test]
    fn test_numeric_operators() {
        assert!(matches(Some("200"), Some("= 100")));
        assert!(!matches(Some("50"), Some("= 100")));
        assert!(matches(Some("100"), Some("== 100.0")));
        assert!(matches(Some("3"), Some("!= 4")));
        assert!(matches(Some("3"), Some("<= 3")));
        assert!(matches(Some("5"), Some(">= 3")));
        assert!(!matches(Some("abc"), Some(">= 3")));
    }

    #[test]
    fn test_string_operators() {
        assert!(matches(Some("abc"), Some("s== abc")));
        assert!(matches(Some("abc"), Some("s!= abd")));
        assert!(matches(Some("abc"), Some("s< abd")));
        assert!(matches(Some("b"), Some("s>= a")));
        assert!(matches(Some("fast ssd pool"), Some("<in> ssd")));
        assert!(!matches(Some("hdd"), Some("<in> ssd")));
    }

    #[test]
    fn test_is_and_or() {
        assert!(matches(Some("True"), Some("<is> True")));
        assert!(matches(Some("false"), Some("<is> False")));
        assert!(!matches(Some("false"), Some("<is> True")));
        assert!(matches(Some("b"), Some("<or> a <or> b <or> c")));
        assert!(!matches(Some("d"), Some("<or> a <or> b")));
        assert!(!matches(None, Some("<or> a")));
    }
}
