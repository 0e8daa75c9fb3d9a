//! Per-(session, agent) conversation persistence.
//!
//! When an agent is built with a session handle, its message history is
//! stored under `agents/{agent_id}/conversation.json` inside the session
//! directory, so a resumed run transparently continues the same
//! conversation.

use std::io::Write;
use std::path::PathBuf;

use crate::error::{AiError, Result};
use crate::llm::Message;

const CONVERSATION_FILE: &str = "conversation.json";

/// Durable message log for one (session, agent) pair.
#[derive(Debug)]
pub struct ConversationLog {
    dir: PathBuf,
    messages: Vec<Message>,
}

impl ConversationLog {
    /// Open (or start) the log in the given agent directory.
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CONVERSATION_FILE);
        let messages = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| AiError::Agent(format!("corrupt conversation log: {e}")))?
        } else {
            Vec::new()
        };
        Ok(Self { dir, messages })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a completed user/assistant turn and persist.
    pub fn append_turn(&mut self, user: Message, assistant: Message) -> Result<()> {
        self.messages.push(user);
        self.messages.push(assistant);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(&self.messages)?;
        bytes.push(b'\n');

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(self.dir.join(CONVERSATION_FILE))
            .map_err(|e| AiError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("writer");

        let mut log = ConversationLog::open(agent_dir.clone()).unwrap();
        assert!(log.messages().is_empty());
        log.append_turn(Message::user("hi"), Message::assistant("hello"))
            .unwrap();

        let reopened = ConversationLog::open(agent_dir).unwrap();
        assert_eq!(reopened.messages().len(), 2);
        assert_eq!(reopened.messages()[1].content, "hello");
    }
}
