use indexmap::IndexMap;

use super::turn::{Role, Turn, TurnContent, TurnId, TurnUpdate};

/// Where a regeneration writes and whether it may run on a non-user prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegeneratePlan {
    pub target: TurnId,
    pub force: bool,
}

/// Ordered id→turn mapping plus the composition cursor.
///
/// Iteration order is conversation order. The cursor may name an id that is
/// not in the mapping yet; that turn is created as an empty user turn the
/// first time it is written through [`Conversation::set_turn`].
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    turns: IndexMap<TurnId, Turn>,
    cursor: TurnId,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            turns: IndexMap::new(),
            cursor: TurnId::random(),
        }
    }

    /// Rebuilds a conversation from stored turns. Without a stored cursor the
    /// cursor is picked the same way it is after a mutation.
    pub fn from_parts(turns: IndexMap<TurnId, Turn>, cursor: Option<TurnId>) -> Self {
        let mut conversation = Self {
            turns,
            cursor: TurnId::random(),
        };
        match cursor {
            Some(cursor) => conversation.cursor = cursor,
            None => {
                conversation.pick_cursor();
            }
        }
        conversation
    }

    pub fn cursor(&self) -> &TurnId {
        &self.cursor
    }

    pub fn set_cursor(&mut self, id: TurnId) {
        self.cursor = id;
    }

    pub fn turns(&self) -> &IndexMap<TurnId, Turn> {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn get(&self, id: &TurnId) -> Option<&Turn> {
        self.turns.get(id)
    }

    pub fn contains(&self, id: &TurnId) -> bool {
        self.turns.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TurnId, &Turn)> {
        self.turns.iter()
    }

    pub fn position(&self, id: &TurnId) -> Option<usize> {
        self.turns.get_index_of(id)
    }

    pub fn next_id_after(&self, id: &TurnId) -> Option<&TurnId> {
        let index = self.position(id)?;
        self.turns.get_index(index + 1).map(|(next, _)| next)
    }

    /// Creates `id` as an empty user turn when absent, then applies `update`.
    pub fn set_turn(&mut self, id: &TurnId, update: TurnUpdate) {
        let turn = self
            .turns
            .entry(id.clone())
            .or_insert_with(|| Turn::user(""));
        match update {
            TurnUpdate::Text(text) => turn.content.text = text,
            TurnUpdate::Image(url) => turn.content.image = Some(url),
        }
    }

    /// Applies `update` to the turn under the cursor and returns its id.
    pub fn update_cursor_turn(&mut self, update: TurnUpdate) -> TurnId {
        let id = self.cursor.clone();
        self.set_turn(&id, update);
        id
    }

    pub fn delete_turn(&mut self, id: &TurnId) -> Option<Turn> {
        let removed = self.turns.shift_remove(id)?;
        if &self.cursor == id {
            self.pick_cursor();
        }
        Some(removed)
    }

    /// Turns from the start through `id` inclusive. An id that is not in the
    /// mapping yet yields the whole conversation.
    pub fn prefix_up_to(&self, id: &TurnId) -> Vec<(&TurnId, &Turn)> {
        let take = self
            .turns
            .get_index_of(id)
            .map(|index| index + 1)
            .unwrap_or(self.turns.len());
        self.turns.iter().take(take).collect()
    }

    pub fn pick_cursor(&mut self) -> &TurnId {
        self.cursor = match self.turns.last() {
            Some((id, turn)) if turn.role == Role::User => id.clone(),
            _ => TurnId::random(),
        };
        &self.cursor
    }

    /// Moves the cursor onto `id` and returns the text to load into the editor.
    pub fn begin_edit(&mut self, id: &TurnId) -> Option<String> {
        let text = self.turns.get(id)?.content.text.clone();
        self.cursor = id.clone();
        Some(text)
    }

    /// Writes a streamed reply: the turn keeps its position when it exists and
    /// is appended otherwise. Any previous content or error is replaced.
    pub fn upsert_reply(&mut self, id: &TurnId, text: &str) {
        let reply = Turn::assistant(text);
        match self.turns.get_mut(id) {
            Some(turn) => *turn = reply,
            None => {
                self.turns.insert(id.clone(), reply);
            }
        }
    }

    /// Records a failed generation: the reply turn gets the text streamed
    /// before the failure (possibly empty) and the error note. An `id` naming
    /// a user or system turn is never overwritten; a fresh assistant turn is
    /// inserted right after it instead. Returns the id that holds the note.
    pub fn mark_failed(&mut self, id: &TurnId, text: &str, message: impl Into<String>) -> TurnId {
        let target = match self.turns.get_index_of(id) {
            Some(index) if self.turns[index].role != Role::Assistant => {
                let fresh = TurnId::random();
                self.turns
                    .shift_insert(index + 1, fresh.clone(), Turn::assistant(""));
                fresh
            }
            _ => id.clone(),
        };
        let mut failed = Turn::assistant(text);
        failed.error = Some(message.into());
        self.turns.insert(target.clone(), failed);
        target
    }

    /// Sets the leading system turn, inserting it at the front when missing.
    /// Blank text removes it.
    pub fn set_system_prompt(&mut self, text: &str) -> Option<TurnId> {
        let existing = self
            .turns
            .first()
            .filter(|(_, turn)| turn.role == Role::System)
            .map(|(id, _)| id.clone());

        if text.trim().is_empty() {
            if let Some(id) = existing {
                self.delete_turn(&id);
            }
            return None;
        }

        if let Some(id) = existing {
            if let Some(turn) = self.turns.get_mut(&id) {
                turn.content = TurnContent {
                    text: text.to_string(),
                    image: None,
                };
            }
            return Some(id);
        }

        let id = TurnId::random();
        self.turns.shift_insert(0, id.clone(), Turn::system(text));
        Some(id)
    }

    /// Cursor bookkeeping for a regeneration requested on `id`.
    ///
    /// On an assistant turn the cursor moves to the preceding turn and the
    /// same id is overwritten (forced, the preceding turn may itself be an
    /// assistant turn after deletions). On a user turn the cursor stays there
    /// and the following id, or a fresh one, receives the reply.
    pub fn plan_regenerate(&mut self, id: &TurnId) -> Option<RegeneratePlan> {
        let index = self.position(id)?;
        let role = self.turns.get_index(index)?.1.role;
        match role {
            Role::Assistant => {
                let previous = index.checked_sub(1)?;
                let (previous_id, _) = self.turns.get_index(previous)?;
                self.cursor = previous_id.clone();
                Some(RegeneratePlan {
                    target: id.clone(),
                    force: true,
                })
            }
            Role::User => {
                self.cursor = id.clone();
                let target = self
                    .turns
                    .get_index(index + 1)
                    .filter(|(_, next)| next.role == Role::Assistant)
                    .map(|(next, _)| next.clone())
                    .unwrap_or_else(TurnId::random);
                Some(RegeneratePlan {
                    target,
                    force: false,
                })
            }
            Role::System => None,
        }
    }
}
