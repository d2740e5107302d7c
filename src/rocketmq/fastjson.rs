//! Lenient reader for remoting bodies.
//!
//! Brokers serialize bodies with fastjson, which writes map keys as raw
//! values: `{0:"10.0.0.1:10911"}` or `{{"topic":"t",...}:{...}}`. This parser
//! accepts such input and turns every non-string key into its compact JSON
//! text, so the result can go through ordinary serde.

use crate::error::{ExporterError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

const MAX_DEPTH: usize = 128;

pub fn from_slice<T: DeserializeOwned>(input: &[u8]) -> Result<T> {
    let value = parse(input)?;
    Ok(serde_json::from_value(value)?)
}

pub fn parse(input: &[u8]) -> Result<Value> {
    let mut parser = Parser { src: input, pos: 0 };
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> ExporterError {
        ExporterError::Protocol(format!("invalid body at byte {}: {msg}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.object(depth),
            Some(b'[') => self.array(depth),
            Some(b'"') => self.string().map(Value::String),
            Some(b't') => self.literal("true", Value::Bool(true)),
            Some(b'f') => self.literal("false", Value::Bool(false)),
            Some(b'n') => self.literal("null", Value::Null),
            Some(b'-' | b'0'..=b'9') => self.number(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn object(&mut self, depth: usize) -> Result<Value> {
        self.expect(b'{')?;
        let mut map = Map::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Object(map));
        }
        loop {
            self.skip_ws();
            let key = if self.peek() == Some(b'"') {
                self.string()?
            } else {
                let raw = self.value(depth + 1)?;
                serde_json::to_string(&raw)?
            };
            self.expect(b':')?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);

            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Object(map));
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn array(&mut self, depth: usize) -> Result<Value> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        loop {
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        let start = self.pos;
        self.pos += 1; // opening quote
        loop {
            match self.peek() {
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated string")),
            }
        }
        let raw = self
            .src
            .get(start..self.pos)
            .ok_or_else(|| self.error("unterminated string"))?;
        // Escapes follow JSON rules, let serde_json unescape them.
        Ok(serde_json::from_slice(raw)?)
    }

    fn number(&mut self) -> Result<Value> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
        ) {
            self.pos += 1;
        }
        Ok(serde_json::from_slice(&self.src[start..self.pos])?)
    }

    fn literal(&mut self, word: &str, value: Value) -> Result<Value> {
        let end = self.pos + word.len();
        if self.src.get(self.pos..end) == Some(word.as_bytes()) {
            self.pos = end;
            Ok(value)
        } else {
            Err(self.error("invalid literal"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rocketmq::model::{BrokerData, MessageQueue};
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        let value = parse(br#"{"a":[1,2.5,"x",true,null],"b":{"c":-3}}"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2.5, "x", true, null], "b": {"c": -3}}));
    }

    #[test]
    fn test_numeric_keys() {
        let broker: BrokerData = from_slice(
            br#"{"cluster":"DefaultCluster","brokerName":"broker-a","brokerAddrs":{0:"10.0.0.1:10911",1:"10.0.0.2:10911"}}"#,
        )
        .unwrap();
        assert_eq!(broker.broker_addrs.get(&0).unwrap(), "10.0.0.1:10911");
        assert_eq!(broker.broker_addrs.get(&1).unwrap(), "10.0.0.2:10911");
    }

    #[test]
    fn test_object_keys() {
        let value = parse(
            br#"{"offsetTable":{{"brokerName":"broker-a","queueId":3,"topic":"orders"}:{"brokerOffset":8,"consumerOffset":5}}}"#,
        )
        .unwrap();
        let table = value["offsetTable"].as_object().unwrap();
        assert_eq!(table.len(), 1);

        let (key, offsets) = table.iter().next().unwrap();
        let queue: MessageQueue = serde_json::from_str(key).unwrap();
        assert_eq!(queue, MessageQueue::new("orders", "broker-a", 3));
        assert_eq!(offsets["brokerOffset"], json!(8));
    }

    #[test]
    fn test_string_escapes() {
        let value = parse(r#"{"remark":"line\n\"quoted\" é"}"#.as_bytes()).unwrap();
        assert_eq!(value["remark"], json!("line\n\"quoted\" \u{e9}"));
    }

    #[test]
    fn test_whitespace_and_empty_containers() {
        let value = parse(b" { \"a\" : { } , \"b\" : [ ] } ").unwrap();
        assert_eq!(value, json!({"a": {}, "b": []}));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(parse(br#"{"a":1"#).is_err());
        assert!(parse(br#"{"a" 1}"#).is_err());
        assert!(parse(br#"{"a":1} x"#).is_err());
        assert!(parse(br#""unterminated"#).is_err());
        assert!(parse(b"nul").is_err());
    }
}
