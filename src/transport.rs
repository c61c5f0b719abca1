//! Remote call interface and the method call model.
//!
//! A [`MethodCall`] is built from a text signature such as `balanceOf(address)(uint256)`:
//! the first group lists the argument types, the optional second group the return types.
//! A bare name (`decimals`) is a zero-argument call whose return data is handed back raw.

use crate::errors::CoreError;
use async_trait::async_trait;
use ethers::abi::param_type::Reader;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Bytes};
use std::fmt;
use std::str::FromStr;

/// The node connection, as seen by the core.
///
/// Reverts are reported as [`CoreError::CallReverted`]; anything that prevented the call from
/// being answered is a [`CoreError::TransportFault`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// One call, one round trip.
    async fn call(
        &self,
        target: Address,
        method: &MethodCall,
        block: Option<u64>,
    ) -> Result<Bytes, CoreError>;

    /// Many calls in one aggregated round trip. The outer error means the aggregate itself
    /// failed; inner errors are per-call reverts. The returned list matches `calls` in length
    /// and order.
    async fn call_many(
        &self,
        calls: &[(Address, MethodCall)],
        block: Option<u64>,
    ) -> Result<Vec<Result<Bytes, CoreError>>, CoreError>;
}

/// A read-only contract method plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    label: String,
    name: String,
    inputs: Vec<ParamType>,
    outputs: Vec<ParamType>,
    args: Vec<Token>,
}

impl MethodCall {
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let text = text.trim();
        let invalid = |reason: &str| CoreError::InvalidMethod(format!("{:?}: {}", text, reason));

        let (name, rest) = match text.find('(') {
            Some(idx) => (&text[..idx], &text[idx..]),
            None => (text, ""),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("bad method name"));
        }

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        if !rest.is_empty() {
            let (input_group, rest) = split_group(rest).ok_or_else(|| invalid("unbalanced parentheses"))?;
            inputs = parse_types(input_group).map_err(|e| invalid(&e))?;

            let rest = rest.trim();
            if !rest.is_empty() {
                let (output_group, trailing) =
                    split_group(rest).ok_or_else(|| invalid("unbalanced parentheses"))?;
                if !trailing.trim().is_empty() {
                    return Err(invalid("unexpected trailing text"));
                }
                outputs = parse_types(output_group).map_err(|e| invalid(&e))?;
            }
        }

        Ok(Self {
            label: text.to_string(),
            name: name.to_string(),
            inputs,
            outputs,
            args: Vec::new(),
        })
    }

    /// Binds arguments, checked against the declared input types.
    pub fn with_args(mut self, args: Vec<Token>) -> Result<Self, CoreError> {
        if args.len() != self.inputs.len() || !Token::types_check(&args, &self.inputs) {
            return Err(CoreError::InvalidMethod(format!(
                "{}: arguments {:?} do not match input types",
                self.label, args
            )));
        }
        self.args = args;
        Ok(self)
    }

    /// The text the call was parsed from. Used as the result key.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Token] {
        &self.args
    }

    /// Canonical signature used for the selector, e.g. `balanceOf(address)`.
    pub fn signature(&self) -> String {
        let types: Vec<String> = self.inputs.iter().map(|p| p.to_string()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    pub fn selector(&self) -> [u8; 4] {
        ethers::utils::id(self.signature())
    }

    pub fn calldata(&self) -> Bytes {
        let mut data = self.selector().to_vec();
        data.extend(ethers::abi::encode(&self.args));
        Bytes::from(data)
    }

    /// Decodes return data: one token for one output, a tuple for several, the raw bytes
    /// when no outputs were declared.
    pub fn decode(&self, data: &[u8]) -> Result<Token, CoreError> {
        if self.outputs.is_empty() {
            return Ok(Token::Bytes(data.to_vec()));
        }
        if data.is_empty() {
            return Err(CoreError::CallReverted {
                method: self.label.clone(),
                reason: "empty return data".to_string(),
            });
        }

        let mut tokens =
            ethers::abi::decode(&self.outputs, data).map_err(|e| CoreError::CallReverted {
                method: self.label.clone(),
                reason: format!("undecodable return data: {}", e),
            })?;
        if tokens.len() == 1 {
            Ok(tokens.remove(0))
        } else {
            Ok(Token::Tuple(tokens))
        }
    }

    pub fn reverted(&self, reason: impl Into<String>) -> CoreError {
        CoreError::CallReverted {
            method: self.label.clone(),
            reason: reason.into(),
        }
    }
}

impl FromStr for MethodCall {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Splits `"(a,(b,c))rest"` into `("a,(b,c)", "rest")`.
fn split_group(s: &str) -> Option<(&str, &str)> {
    if !s.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[1..i], &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_types(group: &str) -> Result<Vec<ParamType>, String> {
    let mut types = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in group.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                types.push(parse_type(&group[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = group[start..].trim();
    if !last.is_empty() {
        types.push(parse_type(last)?);
    } else if !types.is_empty() {
        return Err("empty type".to_string());
    }
    Ok(types)
}

fn parse_type(raw: &str) -> Result<ParamType, String> {
    let raw = raw.trim();
    // drop a parameter name, as in "address owner"
    let ty = if raw.starts_with('(') {
        raw
    } else {
        raw.split_whitespace().next().unwrap_or("")
    };
    if ty.is_empty() {
        return Err("empty type".to_string());
    }
    Reader::read(ty).map_err(|e| format!("{}: {}", ty, e))
}

/// Best-effort reason from revert data carrying `Error(string)`.
pub fn revert_reason(data: &[u8]) -> String {
    const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
    if data.len() > 4 && data[..4] == ERROR_SELECTOR {
        if let Ok(mut tokens) = ethers::abi::decode(&[ParamType::String], &data[4..]) {
            if let Some(Token::String(reason)) = tokens.pop() {
                return reason;
            }
        }
    }
    if data.is_empty() {
        "execution reverted".to_string()
    } else {
        format!("execution reverted: 0x{}", hex::encode(data))
    }
}
