//! A scientific calculator tool, adapted from a richer standalone calculator down to the
//! arithmetic, trigonometric, logarithmic, and statistical operations most agent
//! expressions actually use. Built on `evalexpr`, which only knows its own `math::`
//! namespace, so [`Calculator::prepare_expression`] rewrites common notation (`pi`, `e`,
//! `sqrt(x)`, `log(x)`, `**`) into that namespace before evaluating.

use crate::core::tool_registry::{Tool, ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolResult};
use async_trait::async_trait;
use evalexpr::ContextWithMutableVariables;

/// Stateless, thread-safe arithmetic/trig/log/statistics evaluator.
///
/// All trigonometric functions take radians. Statistical functions (`mean`, `median`,
/// `std`, ...) take a bracketed or parenthesised comma-separated array, e.g.
/// `mean([1, 2, 3])`.
#[derive(Clone, Default)]
pub struct Calculator;

impl Calculator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a mathematical expression, trying the statistical-function forms first
    /// since they use array syntax `evalexpr` itself does not understand.
    pub fn evaluate(&self, expression: &str) -> Result<f64, String> {
        let expression = expression.trim();
        if let Ok(result) = self.try_statistical_function(expression) {
            return Ok(result);
        }
        self.evaluate_math_expression(expression)
    }

    fn evaluate_math_expression(&self, expression: &str) -> Result<f64, String> {
        let expr = self.prepare_expression(expression);

        let mut context = evalexpr::HashMapContext::<evalexpr::DefaultNumericTypes>::new();
        let _ = context.set_value("math::PI".to_string(), evalexpr::Value::Float(std::f64::consts::PI));
        let _ = context.set_value("math::E".to_string(), evalexpr::Value::Float(std::f64::consts::E));

        match evalexpr::eval_with_context(&expr, &context) {
            Ok(value) => value.as_number().map_err(|_| "result is not a number".to_string()),
            Err(e) => Err(format!("evaluation error: {}", e)),
        }
    }

    /// Rewrite common mathematical notation into `evalexpr`'s `math::` namespace.
    fn prepare_expression(&self, expr: &str) -> String {
        let mut prepared = expr.trim().to_string();

        prepared = prepared.replace("arcsin", "asin");
        prepared = prepared.replace("arccos", "acos");
        prepared = prepared.replace("arctan", "atan");

        prepared = self.replace_log_base(&prepared, "log2(", "math::ln(2)");
        prepared = self.replace_log_base(&prepared, "log(", "math::ln(10)");

        for func in [
            "atan2", "sinh", "cosh", "tanh", "asin", "acos", "atan", "sqrt", "abs", "ln", "exp", "sin", "cos", "tan",
        ] {
            prepared = self.namespace_function(&prepared, func);
        }

        prepared = prepared.replace("**", "^");
        prepared = self.replace_constant(&prepared, "pi", "math::PI");
        prepared = self.replace_constant(&prepared, "e", "math::E");
        prepared
    }

    /// `log(x)` -> `math::ln(x)/math::ln(10)`, `log2(x)` -> `math::ln(x)/math::ln(2)`.
    fn replace_log_base(&self, expr: &str, needle: &str, denominator: &str) -> String {
        if !expr.contains(needle) {
            return expr.to_string();
        }
        // `log2(` contains `log(` as a substring target only via the needle match itself,
        // so each call here handles exactly one of the two forms.
        let mut result = String::new();
        let mut rest = expr;
        while let Some(idx) = rest.find(needle) {
            result.push_str(&rest[..idx]);
            let after_paren = &rest[idx + needle.len()..];
            let close = after_paren.find(')').unwrap_or(after_paren.len());
            let arg = &after_paren[..close];
            result.push_str(&format!("math::ln({})/{}", arg, denominator));
            rest = &after_paren[close.min(after_paren.len())..];
            rest = rest.strip_prefix(')').unwrap_or(rest);
        }
        result.push_str(rest);
        result
    }

    /// Prefix bare function names (`sqrt(`, `sin(`, ...) with `math::` at word boundaries.
    fn namespace_function(&self, expr: &str, func_name: &str) -> String {
        let chars: Vec<char> = expr.chars().collect();
        let mut result = String::new();
        let mut i = 0;
        while i < chars.len() {
            let remaining: String = chars[i..].iter().collect();
            let already_prefixed = i >= 6 && chars[i - 6..i].iter().collect::<String>() == "math::";
            let word_boundary_before = i == 0 || !chars[i - 1].is_alphanumeric();
            if !already_prefixed
                && word_boundary_before
                && remaining.starts_with(func_name)
                && remaining[func_name.len()..].trim_start().starts_with('(')
            {
                result.push_str("math::");
                result.push_str(func_name);
                i += func_name.len();
                continue;
            }
            result.push(chars[i]);
            i += 1;
        }
        result
    }

    /// Replace a standalone constant (`pi`, `e`) that is not part of a larger identifier.
    fn replace_constant(&self, expr: &str, constant: &str, replacement: &str) -> String {
        let chars: Vec<char> = expr.chars().collect();
        let constant_len = constant.chars().count();
        let mut result = String::new();
        let mut i = 0;
        while i < chars.len() {
            if i + constant_len <= chars.len() {
                let substring: String = chars[i..i + constant_len].iter().collect();
                let before_ok = i == 0 || !chars[i - 1].is_alphanumeric();
                let after_ok = i + constant_len >= chars.len() || !chars[i + constant_len].is_alphanumeric();
                if substring == constant && before_ok && after_ok {
                    result.push_str(replacement);
                    i += constant_len;
                    continue;
                }
            }
            result.push(chars[i]);
            i += 1;
        }
        result
    }

    fn try_statistical_function(&self, expression: &str) -> Result<f64, String> {
        let paren_idx = expression.find('(').ok_or("not a statistical function")?;
        let func_name = expression[..paren_idx].trim().to_lowercase();
        let args_end = expression.rfind(')').ok_or("missing closing parenthesis")?;
        let args = expression[paren_idx + 1..args_end].trim();
        let values = || self.parse_array(args);

        match func_name.as_str() {
            "mean" => Ok(values()?.iter().sum::<f64>() / values()?.len() as f64),
            "median" => {
                let mut v = values()?;
                v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let n = v.len();
                Ok(if n % 2 == 1 { v[n / 2] } else { (v[n / 2 - 1] + v[n / 2]) / 2.0 })
            }
            "sum" => Ok(values()?.iter().sum()),
            "count" => Ok(values()?.len() as f64),
            "min" => Ok(values()?.iter().copied().fold(f64::INFINITY, f64::min)),
            "max" => Ok(values()?.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            "var" | "std" => {
                let v = values()?;
                if v.len() < 2 {
                    return Err("variance/std requires at least 2 values".to_string());
                }
                let mean = v.iter().sum::<f64>() / v.len() as f64;
                let variance = v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (v.len() - 1) as f64;
                Ok(if func_name == "std" { variance.sqrt() } else { variance })
            }
            _ => Err("not a known statistical function".to_string()),
        }
    }

    fn parse_array(&self, arg: &str) -> Result<Vec<f64>, String> {
        let arg = arg.trim();
        let content = if (arg.starts_with('[') && arg.ends_with(']')) || (arg.starts_with('(') && arg.ends_with(')')) {
            &arg[1..arg.len() - 1]
        } else {
            arg
        };
        if content.trim().is_empty() {
            return Err("empty array".to_string());
        }
        content
            .split(',')
            .map(|s| s.trim().parse::<f64>().map_err(|_| format!("invalid number in array: {}", s.trim())))
            .collect()
    }
}

#[async_trait]
impl Tool for Calculator {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "calculator",
            "Evaluates arithmetic, trigonometric, logarithmic, and statistical expressions",
        )
        .with_parameter(
            ToolParameter::new("expression", ToolParameterType::String)
                .with_description("e.g. \"2 + 2\", \"sqrt(16)\", \"mean([1, 2, 3])\"")
                .required(),
        )
    }

    async fn invoke(&self, args: serde_json::Value) -> Result<ToolResult, ToolError> {
        let expression = args
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::ToolInputInvalid("expression must be a string".to_string()))?;

        match self.evaluate(expression) {
            Ok(value) => Ok(ToolResult::success(serde_json::json!(value))),
            Err(message) => Err(ToolError::ToolExecutionFailed(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> f64 {
        Calculator::new().evaluate(expr).unwrap()
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(eval("2 + 2 * 3"), 8.0);
        assert_eq!(eval("(2 + 2) * 3"), 12.0);
        assert_eq!(eval("2**3"), 8.0);
    }

    #[test]
    fn trig_functions_take_radians() {
        assert!((eval("sin(0)") - 0.0).abs() < 1e-10);
        assert!((eval("cos(0)") - 1.0).abs() < 1e-10);
    }

    #[test]
    fn constants_resolve() {
        assert!((eval("2 * pi") - std::f64::consts::TAU).abs() < 1e-9);
        assert!((eval("e") - std::f64::consts::E).abs() < 1e-9);
    }

    #[test]
    fn statistical_functions_operate_on_arrays() {
        assert_eq!(eval("mean([1, 2, 3, 4, 5])"), 3.0);
        assert_eq!(eval("sum([1, 2, 3])"), 6.0);
        assert_eq!(eval("max([5, 2, 8, 1])"), 8.0);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let result = Calculator::new().evaluate("1/0");
        assert!(result.is_err() || result.unwrap().is_infinite());
    }

    #[tokio::test]
    async fn invoke_without_expression_is_input_invalid() {
        let tool = Calculator::new();
        let err = tool.invoke(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ToolInputInvalid(_)));
    }

    #[tokio::test]
    async fn invoke_with_malformed_expression_is_execution_failed() {
        let tool = Calculator::new();
        let err = tool
            .invoke(serde_json::json!({"expression": "mean([])"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolExecutionFailed(_)));
    }
}
