//! The built-in script: pass keys through to the targeted pty.

use anyhow::Result;

use crate::script::{PtyRef, Script, ScriptAction, ScriptEvent, ScriptHost};

/// Routes every key press to the event's focused pty, falling back to the
/// most recently attached one. No layout logic, no bindings.
#[derive(Default)]
pub struct PassthroughScript {
  current: Option<PtyRef>,
}

impl Script for PassthroughScript {
  fn dispatch(
    &mut self,
    event: ScriptEvent,
    host: &dyn ScriptHost,
  ) -> Result<Vec<ScriptAction>> {
    match event {
      ScriptEvent::PtyAttach { pty } => {
        self.current = Some(pty);
        Ok(Vec::new())
      }
      ScriptEvent::PtyExited { id } => {
        if self.current.is_some_and(|p| host.pty_id(p) == id) {
          self.current = None;
        }
        Ok(Vec::new())
      }
      ScriptEvent::KeyPress { key } => {
        let target = host.focused_pty().or(self.current);
        Ok(match target {
          Some(pty) => vec![ScriptAction::SendKey { pty, key }],
          None => Vec::new(),
        })
      }
      ScriptEvent::Winsize { .. } | ScriptEvent::Timer { .. } => Ok(Vec::new()),
    }
  }
}
