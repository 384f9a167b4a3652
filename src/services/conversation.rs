//! Multi-step command flows, one pending input per session.
//!
//! A command either completes inline (`/food toast`) or leaves the session
//! waiting for its next free-text message (`/food`, then `toast`).

use diesel::SqliteConnection;
use log::debug;
use std::collections::HashMap;

use crate::db::annotations::AnnotationRef;
use crate::db::connection::StoreError;
use crate::services::plot::{PlotRequest, PlotWindow};
use crate::services::recorder::{self, DEFAULT_FOOD_SEARCH_HOURS, MAX_INSULIN_UNITS};
use crate::timestamp::MinuteStamp;

pub type SessionId = i64;

pub const MENU: &str = "/insulin <units>  log a dose\n\
/food <text>  log a meal\n\
/note <text>  free-form note\n\
/plot [id|HH:MM]  plot the last two hours, around a logged event or a time\n\
/plotfood <text>  find a meal and plot the hours after it";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInput {
    Insulin,
    Food,
    Misc,
    FoodSearch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Plot(PlotRequest, PlotWindow),
}

pub struct Conversations {
    pending: HashMap<SessionId, PendingInput>,
    insulin_window_mins: i64,
}

impl Conversations {
    pub fn new(insulin_window_mins: i64) -> Self {
        Conversations {
            pending: HashMap::new(),
            insulin_window_mins,
        }
    }

    pub fn pending(&self, session: SessionId) -> Option<PendingInput> {
        self.pending.get(&session).copied()
    }

    /// Handle one message from `session` received at `now`.
    pub fn handle(
        &mut self,
        conn: &mut SqliteConnection,
        session: SessionId,
        now: MinuteStamp,
        message: &str,
    ) -> Result<Reply, StoreError> {
        let message = message.trim();
        if let Some(command) = message.strip_prefix('/') {
            let (name, arg) = match command.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim()),
                None => (command, ""),
            };
            return self.command(conn, session, now, name, arg);
        }

        match self.pending.get(&session).copied() {
            Some(input) => self.complete(conn, session, now, input, message),
            None => Ok(Reply::Text("Nothing pending. /menu lists the commands.".into())),
        }
    }

    fn command(
        &mut self,
        conn: &mut SqliteConnection,
        session: SessionId,
        now: MinuteStamp,
        name: &str,
        arg: &str,
    ) -> Result<Reply, StoreError> {
        let input = match name {
            "menu" | "start" => {
                self.pending.remove(&session);
                return Ok(Reply::Text(MENU.into()));
            }
            "plot" => {
                self.pending.remove(&session);
                if arg.is_empty() {
                    return Ok(Reply::Plot(PlotRequest::Latest, PlotWindow::DEFAULT));
                }
                return Ok(match plot_request(now, arg) {
                    Some(request) => Reply::Plot(request, PlotWindow::DEFAULT),
                    None => Reply::Text(format!("Not an event id or time: {}", arg)),
                });
            }
            "insulin" => PendingInput::Insulin,
            "food" => PendingInput::Food,
            "note" => PendingInput::Misc,
            "plotfood" => PendingInput::FoodSearch,
            other => return Ok(Reply::Text(format!("Unknown command /{}. /menu lists the commands.", other))),
        };

        self.pending.insert(session, input);
        if arg.is_empty() {
            debug!("Session {} waiting for {:?}", session, input);
            return Ok(Reply::Text(prompt(input).into()));
        }
        self.complete(conn, session, now, input, arg)
    }

    fn complete(
        &mut self,
        conn: &mut SqliteConnection,
        session: SessionId,
        now: MinuteStamp,
        input: PendingInput,
        text: &str,
    ) -> Result<Reply, StoreError> {
        if text.is_empty() {
            return Ok(Reply::Text(prompt(input).into()));
        }
        let reply = match input {
            PendingInput::Insulin => {
                let units = match text.parse::<i32>() {
                    Ok(units) if (1..=MAX_INSULIN_UNITS).contains(&units) => units,
                    // keep waiting for a usable number
                    _ => {
                        return Ok(Reply::Text(format!(
                            "Not a dose: {}. Send whole units from 1 to {}, e.g. 4",
                            text, MAX_INSULIN_UNITS
                        )));
                    }
                };
                recorder::record_insulin(conn, now, units, self.insulin_window_mins)?;
                Reply::Text(format!("Logged {}u at {}", units, now))
            }
            PendingInput::Food => {
                let stored = recorder::record_food(conn, now, text)?;
                Reply::Text(format!("Logged food at {}: {}", now, stored.food_note))
            }
            PendingInput::Misc => {
                let stored = recorder::record_misc(conn, now, text)?;
                Reply::Text(format!("Logged note at {}: {}", now, stored.misc_note))
            }
            PendingInput::FoodSearch => {
                let hits = recorder::find_food(conn, now, text, DEFAULT_FOOD_SEARCH_HOURS)?;
                food_search_reply(text, &hits)
            }
        };
        self.pending.remove(&session);
        Ok(reply)
    }
}

/// `/plot` argument: an annotation id, `HH:MM` (most recent) or a full
/// `YYYY-MM-DD HH:MM`.
fn plot_request(now: MinuteStamp, arg: &str) -> Option<PlotRequest> {
    if let Ok(id) = arg.parse::<i32>() {
        return Some(PlotRequest::Annotation(id));
    }
    MinuteStamp::parse_key(arg)
        .or_else(|_| now.latest_clock_time(arg))
        .ok()
        .map(PlotRequest::At)
}

fn prompt(input: PendingInput) -> &'static str {
    match input {
        PendingInput::Insulin => "How many units?",
        PendingInput::Food => "What did you eat?",
        PendingInput::Misc => "Note?",
        PendingInput::FoodSearch => "Which food?",
    }
}

fn food_search_reply(needle: &str, hits: &[AnnotationRef]) -> Reply {
    match hits {
        [] => Reply::Text(format!("No food matching {:?} in the last {}h", needle, DEFAULT_FOOD_SEARCH_HOURS)),
        [only] => Reply::Plot(PlotRequest::Annotation(only.id), PlotWindow::FOOD),
        many => {
            let lines = many
                .iter()
                .map(|h| format!("/plot {}  {}  {}", h.id, h.timestamp, h.food_note))
                .collect::<Vec<_>>()
                .join("\n");
            Reply::Text(format!("{} matches:\n{}", many.len(), lines))
        }
    }
}
