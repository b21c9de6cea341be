use crate::protocol::mysql::constants::{CommandCode, MAX_PAYLOAD_LEN};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SESSION = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Select,
    Insert,
    Update,
    Delete,
    Set,
    Use,
    Call,
    Show,
    Explain,
    Other,
}

/// Classification of one client request, as produced by the SQL parser at
/// the boundary of this crate.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub command: u8,
    /// The statement text for text-protocol requests; `None` for binary
    /// protocol commands.
    pub sql: Option<String>,
    pub canonical: Option<String>,
    pub op: OpCode,
    pub type_mask: TypeMask,
    pub multi_part: bool,
    /// Read-your-writes style dependency on the previous statement
    /// (FOUND_ROWS(), ROW_COUNT(), LAST_INSERT_ID(), SHOW WARNINGS).
    pub relates_to_previous: bool,
    pub session_modifying: bool,
}

impl QueryInfo {
    pub fn will_respond(&self) -> bool {
        CommandCode::will_respond(self.command)
    }

    /// A plain single-packet read-only text SELECT, eligible for
    /// lag-shedding.
    pub fn is_simple_select(&self) -> bool {
        self.op == OpCode::Select
            && self.sql.is_some()
            && !self.type_mask.contains(TypeMask::WRITE)
            && !self.multi_part
    }
}

pub trait QueryParser: Send + Sync {
    fn classify(&self, payload: &[u8]) -> QueryInfo;
}

/// Replace string and numeric literals with placeholders so statements that
/// differ only in their constants hash to the same canonical form.
pub fn canonicalize(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' | '"' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        // doubled quote inside the literal
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                out.push('?');
            }
            '0'..='9' => {
                let part_of_identifier = out
                    .chars()
                    .last()
                    .map(|p| p.is_ascii_alphanumeric() || p == '_')
                    .unwrap_or(false);
                if part_of_identifier {
                    out.push(c);
                    i += 1;
                } else {
                    while i < bytes.len()
                        && (bytes[i].is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'x'
                            || bytes[i].is_ascii_hexdigit())
                    {
                        i += 1;
                    }
                    out.push('?');
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// The built-in classifier: identifies the command byte and derives a rough
/// classification from the first keyword. A real parser plugin can replace
/// it through the `QueryParser` trait.
pub struct DefaultParser;

impl DefaultParser {
    fn classify_sql(sql: &str) -> (OpCode, TypeMask, bool, bool) {
        let trimmed = sql.trim_start();
        let upper: String = trimmed
            .chars()
            .take(64)
            .collect::<String>()
            .to_ascii_uppercase();
        let first_word = upper.split_whitespace().next().unwrap_or("");

        let (op, mut mask, session) = match first_word {
            "SELECT" => (OpCode::Select, TypeMask::READ, false),
            "INSERT" | "REPLACE" => (OpCode::Insert, TypeMask::WRITE, false),
            "UPDATE" => (OpCode::Update, TypeMask::WRITE, false),
            "DELETE" => (OpCode::Delete, TypeMask::WRITE, false),
            "SET" => (OpCode::Set, TypeMask::SESSION, true),
            "USE" => (OpCode::Use, TypeMask::SESSION, true),
            "CALL" => (OpCode::Call, TypeMask::WRITE, false),
            "SHOW" => (OpCode::Show, TypeMask::READ, false),
            "EXPLAIN" | "ANALYZE" => (OpCode::Explain, TypeMask::READ, false),
            _ => (OpCode::Other, TypeMask::WRITE, false),
        };

        let upper_all = sql.to_ascii_uppercase();
        if op == OpCode::Select && upper_all.contains("FOR UPDATE") {
            mask |= TypeMask::WRITE;
        }

        let relates_to_previous = upper_all.contains("FOUND_ROWS(")
            || upper_all.contains("ROW_COUNT(")
            || upper_all.contains("LAST_INSERT_ID(")
            || upper_all.trim_start().starts_with("SHOW WARNINGS");

        (op, mask, session, relates_to_previous)
    }
}

impl QueryParser for DefaultParser {
    fn classify(&self, payload: &[u8]) -> QueryInfo {
        let command = payload.first().copied().unwrap_or(0);
        let multi_part = payload.len() >= MAX_PAYLOAD_LEN;

        let mut info = QueryInfo {
            command,
            sql: None,
            canonical: None,
            op: OpCode::Other,
            type_mask: TypeMask::empty(),
            multi_part,
            relates_to_previous: false,
            session_modifying: false,
        };

        match CommandCode::from_byte(command) {
            Some(CommandCode::ComQuery) => {
                let sql = String::from_utf8_lossy(&payload[1..]).to_string();
                let (op, mask, session, relates) = Self::classify_sql(&sql);
                info.canonical = Some(canonicalize(&sql));
                info.sql = Some(sql);
                info.op = op;
                info.type_mask = mask;
                info.session_modifying = session;
                info.relates_to_previous = relates;
            }
            Some(CommandCode::ComStmtPrepare) => {
                let sql = String::from_utf8_lossy(&payload[1..]).to_string();
                info.canonical = Some(canonicalize(&sql));
                info.op = OpCode::Other;
                info.session_modifying = true;
            }
            Some(CommandCode::ComInitDB) => {
                info.op = OpCode::Use;
                info.type_mask = TypeMask::SESSION;
                info.session_modifying = true;
            }
            Some(CommandCode::ComSetOption) => {
                info.type_mask = TypeMask::SESSION;
                info.session_modifying = true;
            }
            Some(CommandCode::ComStmtExecute) => {
                info.op = OpCode::Select;
                info.type_mask = TypeMask::READ;
            }
            _ => {}
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str) -> Vec<u8> {
        let mut p = vec![CommandCode::ComQuery as u8];
        p.extend_from_slice(sql.as_bytes());
        p
    }

    #[test]
    fn test_canonicalize_literals() {
        assert_eq!(
            canonicalize("SELECT * FROM t WHERE id = 17 AND name = 'bob'"),
            "SELECT * FROM t WHERE id = ? AND name = ?"
        );
        assert_eq!(canonicalize("SELECT a1 FROM t2"), "SELECT a1 FROM t2");
    }

    #[test]
    fn test_canonicalize_escaped_quote() {
        assert_eq!(
            canonicalize("SELECT 'it''s', \"a\\\"b\""),
            "SELECT ?, ?"
        );
    }

    #[test]
    fn test_simple_select_classification() {
        let info = DefaultParser.classify(&query("SELECT 1"));
        assert_eq!(info.op, OpCode::Select);
        assert!(info.is_simple_select());
        assert!(!info.session_modifying);
    }

    #[test]
    fn test_select_for_update_is_a_write() {
        let info = DefaultParser.classify(&query("SELECT * FROM t FOR UPDATE"));
        assert_eq!(info.op, OpCode::Select);
        assert!(info.type_mask.contains(TypeMask::WRITE));
        assert!(!info.is_simple_select());
    }

    #[test]
    fn test_set_is_session_modifying() {
        let info = DefaultParser.classify(&query("SET autocommit=0"));
        assert_eq!(info.op, OpCode::Set);
        assert!(info.session_modifying);
    }

    #[test]
    fn test_relates_to_previous() {
        assert!(DefaultParser.classify(&query("SELECT FOUND_ROWS()")).relates_to_previous);
        assert!(DefaultParser.classify(&query("SHOW WARNINGS")).relates_to_previous);
        assert!(!DefaultParser.classify(&query("SELECT 1")).relates_to_previous);
    }

    #[test]
    fn test_binary_execute_is_not_simple_select() {
        let mut payload = vec![CommandCode::ComStmtExecute as u8];
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&1u32.to_le_bytes());
        let info = DefaultParser.classify(&payload);
        assert!(info.sql.is_none());
        assert!(!info.is_simple_select());
    }
}
