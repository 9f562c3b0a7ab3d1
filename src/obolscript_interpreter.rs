//! The obolscript VM: a reverse-Polish, stack-based evaluator for the
//! locking and unlocking scripts attached to transaction outputs and inputs.
//! The chain engine delegates every authorization question here; it has no
//! notion of keys beyond handing scripts to this module.

use lazy_static::lazy_static;
use regex::Regex;

use crate::hash::hash160;
use crate::script_error::ErrorKind::UnknownToken;
use crate::script_error::ScriptResult;
use crate::wallet::verify_signature;

/// The closed set of operators. Unknown tokens are rejected when the script
/// is tokenized, not when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Drop,
    Dup,
    Hash160,
    Equal,
    EqualVerify,
    CheckSig,
    Op2,
    Op3,
}

/// A token is an operand iff it is written `<value>`; anything else must
/// name an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Operand(String),
    Operator(Op),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Bool(bool),
    Int(u64),
}

impl Value {
    /// A script accepts when its final top-of-stack is non-zero/true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Text(text) => !text.is_empty(),
            Value::Bool(val) => *val,
            Value::Int(n) => *n != 0,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Value::Text(text) => text.clone(),
            Value::Bool(val) => val.to_string(),
            Value::Int(n) => n.to_string(),
        }
    }
}

pub struct ExecutionResult {
    pub top: Option<Value>,
    pub stack: Vec<Value>,
}

pub fn tokenize(script: &str) -> ScriptResult<Vec<Token>> {
    let mut out: Vec<Token> = vec![];

    for raw_token in script.split_whitespace() {
        if raw_token.len() >= 2 && raw_token.starts_with('<') && raw_token.ends_with('>') {
            out.push(Token::Operand(raw_token[1..raw_token.len() - 1].to_owned()));
            continue;
        }

        let op = match raw_token {
            "drop" => Op::Drop,
            "dup" => Op::Dup,
            "hash160" => Op::Hash160,
            "equal" => Op::Equal,
            "equalVerify" => Op::EqualVerify,
            "checkSig" => Op::CheckSig,
            "op_2" => Op::Op2,
            "op_3" => Op::Op3,
            _ => return Err(Box::new(UnknownToken(raw_token.to_owned()))),
        };

        out.push(Token::Operator(op));
    }

    Ok(out)
}

/// Executes a script against the ambient transaction hash, returning the top
/// of the stack plus the stack's contents.
pub fn execute(script: &str, transaction_hash: &str) -> ScriptResult<ExecutionResult> {
    let tokens = tokenize(script)?;
    let mut stack: Vec<Value> = vec![];

    for token in tokens {
        match token {
            Token::Operand(operand) => stack.push(Value::Text(operand)),
            Token::Operator(op) => apply(op, &mut stack, transaction_hash)?,
        };
    }

    Ok(ExecutionResult {
        top: stack.last().cloned(),
        stack,
    })
}

/// Runs `scriptSig ++ scriptPubKey` and reports whether the program accepts.
/// Any script error counts as a rejection.
pub fn evaluate(script_sig: &str, script_pub_key: &str, transaction_hash: &str) -> bool {
    let program = format!("{} {}", script_sig, script_pub_key);

    match execute(&program, transaction_hash) {
        Ok(result) => result.top.map(|v| v.is_truthy()).unwrap_or(false),
        Err(_) => false,
    }
}

fn apply(op: Op, stack: &mut Vec<Value>, transaction_hash: &str) -> ScriptResult<()> {
    match op {
        Op::Drop => op_drop(stack),
        Op::Dup => op_dup(stack),
        Op::Hash160 => op_hash160(stack),
        Op::Equal => op_equal(stack),
        Op::EqualVerify => op_equal_verify(stack),
        Op::CheckSig => op_check_sig(stack, transaction_hash),
        Op::Op2 => op_push_literal(stack, 2),
        Op::Op3 => op_push_literal(stack, 3),
    }
}

// Operators on a stack too short for them are no-ops.

fn op_drop(stack: &mut Vec<Value>) -> ScriptResult<()> {
    stack.pop();

    Ok(())
}

fn op_dup(stack: &mut Vec<Value>) -> ScriptResult<()> {
    if let Some(top) = stack.last().cloned() {
        stack.push(top);
    }

    Ok(())
}

fn op_hash160(stack: &mut Vec<Value>) -> ScriptResult<()> {
    if let Some(top) = stack.pop() {
        stack.push(Value::Text(hash160(&top.as_text())));
    }

    Ok(())
}

fn op_equal(stack: &mut Vec<Value>) -> ScriptResult<()> {
    if stack.len() < 2 {
        return Ok(());
    }

    let top1 = stack.pop().unwrap();
    let top2 = stack.pop().unwrap();

    stack.push(Value::Bool(top1 == top2));

    Ok(())
}

fn op_equal_verify(stack: &mut Vec<Value>) -> ScriptResult<()> {
    if stack.len() < 2 {
        return Ok(());
    }

    op_equal(stack)?;

    match stack.pop() {
        Some(Value::Bool(true)) => Ok(()),
        _ => Err(Box::new(crate::script_error::ErrorKind::EqualVerifyFailed)),
    }
}

fn op_check_sig(stack: &mut Vec<Value>, transaction_hash: &str) -> ScriptResult<()> {
    if stack.len() < 2 {
        return Ok(());
    }

    let public_key = stack.pop().unwrap();
    let signature = stack.pop().unwrap();

    let is_valid = verify_signature(
        transaction_hash,
        &signature.as_text(),
        &public_key.as_text(),
    );

    stack.push(Value::Bool(is_valid));

    Ok(())
}

fn op_push_literal(stack: &mut Vec<Value>, n: u64) -> ScriptResult<()> {
    stack.push(Value::Int(n));

    Ok(())
}

/// The standard P2PKH locking script for a public-key fingerprint.
pub fn pay_to_pub_key_hash(pub_key_hash: &str) -> String {
    format!("dup hash160 <{}> equalVerify checkSig", pub_key_hash)
}

/// The standard unlocking script: a signature and the public key it belongs
/// to, both as operands.
pub fn script_sig(signature: &str, public_key: &str) -> String {
    format!("<{}> <{}>", signature, public_key)
}

/// Splits a standard unlocking script into its signature and public key.
pub fn script_sig_parts(code: &str) -> Option<(String, String)> {
    let tokens = tokenize(code).ok()?;

    match tokens.as_slice() {
        [Token::Operand(sig), Token::Operand(public_key)] => {
            Some((sig.clone(), public_key.clone()))
        }
        _ => None,
    }
}

/// Extracts the recipient fingerprint from a P2PKH locking script. Scripts
/// generated by this software always carry the full 40-digit hex form.
pub fn p2pkh_recipient(code: &str) -> Option<String> {
    lazy_static! {
        static ref RE: Regex =
            Regex::new(r"^dup hash160 <((\d|[a-f]|[A-F]){40})> equalVerify checkSig$").unwrap();
    };

    RE.captures(code).map(|caps| caps[1].to_owned())
}
