use byteorder::{ByteOrder, LittleEndian};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Ping,
    Load,
    Exec,
    Chat,
    Tokens,
    SetGen,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: OpCode,
    pub agent_id: String,
    pub content_length: usize,
}

impl CommandHeader {
    /// Parses the header line `VERB AgentID Length`, e.g. `EXEC coder_01 500`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.is_empty() {
            return Err("Empty header".to_string());
        }

        let opcode = match parts[0].to_uppercase().as_str() {
            "PING" => OpCode::Ping,
            "LOAD" => OpCode::Load,
            "EXEC" => OpCode::Exec,
            "CHAT" => OpCode::Chat,
            "TOKENS" => OpCode::Tokens,
            "SET_GEN" => OpCode::SetGen,
            "STATUS" => OpCode::Status,
            _ => return Err(format!("Unknown opcode: {}", parts[0])),
        };

        let agent_id = if parts.len() > 1 {
            parts[1].to_string()
        } else {
            "sys".to_string()
        };

        let content_length = if parts.len() > 2 {
            parts[2]
                .parse::<usize>()
                .map_err(|_| format!("Invalid content length '{}'", parts[2]))?
        } else {
            0
        };

        Ok(CommandHeader {
            opcode,
            agent_id,
            content_length,
        })
    }
}

pub fn response_ok_code(code: &str, msg: &str) -> Vec<u8> {
    format!("+OK {} {}\r\n", code, msg).into_bytes()
}

pub fn response_err_code(code: &str, msg: &str) -> Vec<u8> {
    format!("-ERR {} {}\r\n", code, msg.replace(['\r', '\n'], " ")).into_bytes()
}

pub fn response_data(data: &[u8]) -> Vec<u8> {
    let header = format!("DATA raw {}\r\n", data.len());
    let mut vec = header.into_bytes();
    vec.extend_from_slice(data);
    vec
}

/// Decodes a `TOKENS` body: little-endian `u32` ids.
pub fn decode_token_ids(payload: &[u8]) -> Result<Vec<u32>, String> {
    if payload.len() % 4 != 0 {
        return Err(format!(
            "TOKENS payload must be a multiple of 4 bytes, got {}",
            payload.len()
        ));
    }
    let mut ids = vec![0u32; payload.len() / 4];
    LittleEndian::read_u32_into(payload, &mut ids);
    Ok(ids)
}

pub fn encode_token_ids(ids: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; ids.len() * 4];
    LittleEndian::write_u32_into(ids, &mut buf);
    buf
}
