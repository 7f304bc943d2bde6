use std::mem;

use crate::protocol::CommandHeader;

#[derive(Debug, Default)]
pub enum ClientState {
    #[default]
    WaitingForHeader,
    ReadingBody {
        header: CommandHeader,
    },
}

#[derive(Debug)]
pub enum ParsedCommand {
    Ok {
        header: CommandHeader,
        payload: Vec<u8>,
    },
    Err(String),
}

/// Drains every complete frame from `buffer`. A partial header or body is left
/// in place and `state` remembers where the next read resumes.
pub fn parse_available_commands(buffer: &mut Vec<u8>, state: &mut ClientState) -> Vec<ParsedCommand> {
    let mut parsed = Vec::new();

    loop {
        match state {
            ClientState::WaitingForHeader => {
                let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
                    break;
                };
                let header_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                let header_str = String::from_utf8_lossy(&header_bytes);
                let header_str = header_str.trim();
                if header_str.is_empty() {
                    continue;
                }

                match CommandHeader::parse(header_str) {
                    Ok(header) if header.content_length == 0 => parsed.push(ParsedCommand::Ok {
                        header,
                        payload: Vec::new(),
                    }),
                    Ok(header) => *state = ClientState::ReadingBody { header },
                    Err(e) => parsed.push(ParsedCommand::Err(e)),
                }
            }
            ClientState::ReadingBody { header } => {
                if buffer.len() < header.content_length {
                    break;
                }
                let payload: Vec<u8> = buffer.drain(..header.content_length).collect();
                if let ClientState::ReadingBody { header } = mem::take(state) {
                    parsed.push(ParsedCommand::Ok { header, payload });
                }
            }
        }
    }

    parsed
}
