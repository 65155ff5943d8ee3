//! 属性过滤器
//!
//! 需求通过 `filter` 指令声明对能力属性的约束，语法为 LDAP 风格的前缀表达式：
//!
//! ```text
//! (&(package=com.acme.util)(version>=1.0)(!(version>=2.0)))
//! ```
//!
//! 支持 `&`、`|`、`!` 组合，`=`、`<=`、`>=`、`~=` 比较，存在性检查 `(attr=*)`
//! 以及带通配符的子串匹配 `(package=com.acme.*)`。比较按能力属性的类型进行。

use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use super::metadata::{AttrValue, Attributes};
use crate::utils::{ContainerError, Result};

/// 过滤器语法树节点
#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Equal(String, String),
    Approx(String, String),
    GreaterEq(String, String),
    LessEq(String, String),
    Present(String),
    Substring { attr: String, pattern: Regex },
}

/// 已解析的过滤器
#[derive(Debug, Clone)]
pub struct Filter {
    root: Node,
    text: String,
}

impl Filter {
    /// 解析过滤器表达式
    ///
    /// # Example
    ///
    /// ```
    /// use chips_container::module::filter::Filter;
    /// use chips_container::module::metadata::{AttrValue, Attributes};
    ///
    /// let filter = Filter::parse("(&(package=p)(version>=1.0))").unwrap();
    /// let mut attrs = Attributes::new();
    /// attrs.insert("package".into(), AttrValue::from("p"));
    /// attrs.insert("version".into(), AttrValue::Version(semver::Version::new(1, 2, 0)));
    /// assert!(filter.matches(&attrs));
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = Parser {
            chars: text.trim().chars().collect(),
            pos: 0,
            source: text,
        };
        let root = parser.parse_node()?;
        parser.skip_whitespace();
        if parser.pos != parser.chars.len() {
            return Err(parser.error("表达式末尾存在多余字符"));
        }
        Ok(Self {
            root,
            text: text.trim().to_string(),
        })
    }

    /// 属性表是否满足过滤器
    pub fn matches(&self, attributes: &Attributes) -> bool {
        eval(&self.root, attributes)
    }

    /// 表达式中出现的全部属性名
    pub fn referenced_attributes(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_attributes(&self.root, &mut names);
        names
    }

    /// 提取索引键
    ///
    /// 顶层或顶层 `&` 中对 `attr` 的精确相等比较值；
    /// 其他形式（或、非、通配符）无法用于索引，返回 `None`。
    pub fn primary_key(&self, attr: &str) -> Option<&str> {
        match &self.root {
            Node::Equal(name, value) if name == attr => Some(value),
            Node::And(children) => children.iter().find_map(|child| match child {
                Node::Equal(name, value) if name == attr => Some(value.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }

    /// 原始表达式
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn collect_attributes(node: &Node, names: &mut BTreeSet<String>) {
    match node {
        Node::And(children) | Node::Or(children) => {
            for child in children {
                collect_attributes(child, names);
            }
        }
        Node::Not(child) => collect_attributes(child, names),
        Node::Equal(attr, _)
        | Node::Approx(attr, _)
        | Node::GreaterEq(attr, _)
        | Node::LessEq(attr, _)
        | Node::Present(attr)
        | Node::Substring { attr, .. } => {
            names.insert(attr.clone());
        }
    }
}

fn eval(node: &Node, attributes: &Attributes) -> bool {
    match node {
        Node::And(children) => children.iter().all(|c| eval(c, attributes)),
        Node::Or(children) => children.iter().any(|c| eval(c, attributes)),
        Node::Not(child) => !eval(child, attributes),
        Node::Present(attr) => attributes.contains_key(attr),
        Node::Equal(attr, literal) => attributes
            .get(attr)
            .map(|v| compare(v, literal, |o| o == Ordering::Equal))
            .unwrap_or(false),
        Node::GreaterEq(attr, literal) => attributes
            .get(attr)
            .map(|v| compare(v, literal, |o| o != Ordering::Less))
            .unwrap_or(false),
        Node::LessEq(attr, literal) => attributes
            .get(attr)
            .map(|v| compare(v, literal, |o| o != Ordering::Greater))
            .unwrap_or(false),
        Node::Approx(attr, literal) => attributes
            .get(attr)
            .map(|v| approx(v, literal))
            .unwrap_or(false),
        Node::Substring { attr, pattern } => attributes
            .get(attr)
            .map(|v| substring(v, pattern))
            .unwrap_or(false),
    }
}

fn compare(value: &AttrValue, literal: &str, accept: impl Fn(Ordering) -> bool + Copy) -> bool {
    match value {
        AttrValue::List(items) => items.iter().any(|item| compare(item, literal, accept)),
        other => other.compare_literal(literal).map(accept).unwrap_or(false),
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn approx(value: &AttrValue, literal: &str) -> bool {
    match value {
        AttrValue::List(items) => items.iter().any(|item| approx(item, literal)),
        AttrValue::String(s) => normalize(s) == normalize(literal),
        other => other
            .compare_literal(literal)
            .map(|o| o == Ordering::Equal)
            .unwrap_or(false),
    }
}

fn substring(value: &AttrValue, pattern: &Regex) -> bool {
    match value {
        AttrValue::List(items) => items.iter().any(|item| substring(item, pattern)),
        AttrValue::String(s) => pattern.is_match(s),
        _ => false,
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> ContainerError {
        ContainerError::InvalidFilter {
            filter: self.source.to_string(),
            reason: format!("{} (位置 {})", reason, self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("期望 '{}'", expected)))
        }
    }

    fn parse_node(&mut self) -> Result<Node> {
        self.expect('(')?;
        self.skip_whitespace();
        let node = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Node::And(self.parse_children()?)
            }
            Some('|') => {
                self.pos += 1;
                Node::Or(self.parse_children()?)
            }
            Some('!') => {
                self.pos += 1;
                Node::Not(Box::new(self.parse_node()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("表达式意外结束")),
        };
        self.expect(')')?;
        Ok(node)
    }

    fn parse_children(&mut self) -> Result<Vec<Node>> {
        let mut children = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() != Some('(') {
                break;
            }
            children.push(self.parse_node()?);
        }
        if children.is_empty() {
            return Err(self.error("组合表达式至少需要一个子表达式"));
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> Result<Node> {
        let mut attr = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '<' | '>' | '~' | '(' | ')') {
                break;
            }
            attr.push(c);
            self.pos += 1;
        }
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(self.error("缺少属性名"));
        }

        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                '='
            }
            Some(c @ ('<' | '>' | '~')) => {
                self.pos += 1;
                if self.peek() != Some('=') {
                    return Err(self.error("比较运算符后应为 '='"));
                }
                self.pos += 1;
                c
            }
            _ => return Err(self.error("缺少比较运算符")),
        };

        let parts = self.parse_value()?;
        match op {
            '=' => Ok(build_equality(attr, parts, self)?),
            _ => {
                if parts.len() > 1 {
                    return Err(self.error("比较运算不支持通配符"));
                }
                let literal = parts.into_iter().next().unwrap_or_default();
                Ok(match op {
                    '<' => Node::LessEq(attr, literal),
                    '>' => Node::GreaterEq(attr, literal),
                    _ => Node::Approx(attr, literal),
                })
            }
        }
    }

    /// 读取比较值，按未转义的 `*` 切分
    fn parse_value(&mut self) -> Result<Vec<String>> {
        let mut parts = vec![String::new()];
        loop {
            match self.peek() {
                None => return Err(self.error("比较值未闭合")),
                Some(')') => break,
                Some('(') => return Err(self.error("比较值中的 '(' 需要转义")),
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| self.error("转义字符后缺少内容"))?;
                    if let Some(last) = parts.last_mut() {
                        last.push(escaped);
                    }
                    self.pos += 1;
                }
                Some('*') => {
                    parts.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
            }
        }
        Ok(parts)
    }
}

fn build_equality(attr: String, parts: Vec<String>, parser: &Parser<'_>) -> Result<Node> {
    if parts.len() == 1 {
        let literal = parts.into_iter().next().unwrap_or_default();
        return Ok(Node::Equal(attr, literal));
    }
    if parts.len() == 2 && parts.iter().all(|p| p.is_empty()) {
        return Ok(Node::Present(attr));
    }
    let body: Vec<String> = parts.iter().map(|p| regex::escape(p)).collect();
    let pattern = Regex::new(&format!("^(?s){}$", body.join(".*")))
        .map_err(|e| parser.error(&format!("通配符模式无效: {}", e)))?;
    Ok(Node::Substring { attr, pattern })
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_simple_equality() {
        let filter = Filter::parse("(package=com.acme)").unwrap();
        assert!(filter.matches(&attrs(&[("package", "com.acme".into())])));
        assert!(!filter.matches(&attrs(&[("package", "com.other".into())])));
        assert!(!filter.matches(&Attributes::new()));
    }

    #[test]
    fn test_version_range() {
        let filter = Filter::parse("(&(package=p)(version>=1.0)(!(version>=2.0)))").unwrap();
        let v = |s: &str| AttrValue::Version(Version::parse(s).unwrap());
        assert!(filter.matches(&attrs(&[("package", "p".into()), ("version", v("1.5.0"))])));
        assert!(!filter.matches(&attrs(&[("package", "p".into()), ("version", v("2.0.0"))])));
        assert!(!filter.matches(&attrs(&[("package", "p".into()), ("version", v("0.9.0"))])));
    }

    #[test]
    fn test_or_and_presence() {
        let filter = Filter::parse("(|(a=1)(b=*))").unwrap();
        assert!(filter.matches(&attrs(&[("a", AttrValue::Long(1))])));
        assert!(filter.matches(&attrs(&[("b", "anything".into())])));
        assert!(!filter.matches(&attrs(&[("c", "x".into())])));
    }

    #[test]
    fn test_substring() {
        let filter = Filter::parse("(package=com.acme.*)").unwrap();
        assert!(filter.matches(&attrs(&[("package", "com.acme.util".into())])));
        assert!(!filter.matches(&attrs(&[("package", "org.acme.util".into())])));

        let filter = Filter::parse("(name=*mid*end)").unwrap();
        assert!(filter.matches(&attrs(&[("name", "xxmidyyend".into())])));
        assert!(!filter.matches(&attrs(&[("name", "xxmidyyendz".into())])));
    }

    #[test]
    fn test_approx_and_lists() {
        let filter = Filter::parse("(name~=Hello World)").unwrap();
        assert!(filter.matches(&attrs(&[("name", "helloworld".into())])));

        let filter = Filter::parse("(tags=beta)").unwrap();
        let list = AttrValue::List(vec!["alpha".into(), "beta".into()]);
        assert!(filter.matches(&attrs(&[("tags", list)])));
    }

    #[test]
    fn test_escaped_characters() {
        let filter = Filter::parse(r"(name=a\*b)").unwrap();
        assert!(filter.matches(&attrs(&[("name", "a*b".into())])));
        assert!(!filter.matches(&attrs(&[("name", "axxb".into())])));
    }

    #[test]
    fn test_referenced_attributes_and_primary_key() {
        let filter = Filter::parse("(&(package=p)(vendor=acme)(!(version>=2)))").unwrap();
        let names: Vec<String> = filter.referenced_attributes().into_iter().collect();
        assert_eq!(names, vec!["package", "vendor", "version"]);
        assert_eq!(filter.primary_key("package"), Some("p"));
        assert_eq!(filter.primary_key("bundle"), None);

        let wildcard = Filter::parse("(package=p.*)").unwrap();
        assert_eq!(wildcard.primary_key("package"), None);
    }

    #[test]
    fn test_invalid_filters() {
        for bad in ["", "(", "(a=b", "(=b)", "(&)", "(a<b)", "(a=b))", "(a>=b*)"] {
            let err = Filter::parse(bad).unwrap_err();
            assert!(
                matches!(err, ContainerError::InvalidFilter { .. }),
                "expected InvalidFilter for {:?}",
                bad
            );
        }
    }
}
