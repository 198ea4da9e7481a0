//! Background task that turns engine events into console output.

use std::collections::HashSet;

use parley_core::{conversation::ConversationRef, store::RemoteStore, view};
use parley_engine::{Engine, EngineEvent, Slot};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::debug;

use crate::app::render_message;

/// What has already been printed, so each change only prints the news.
#[derive(Debug, Default)]
struct Printer {
  conversation:  Option<ConversationRef>,
  messages:      HashSet<String>,
  notifications: HashSet<String>,
  typing:        Option<String>,
}

pub fn spawn<S: RemoteStore + 'static>(engine: Engine<S>) -> JoinHandle<()> {
  let mut events = engine.subscribe_events();
  tokio::spawn(async move {
    let mut printer = Printer::default();
    loop {
      match events.recv().await {
        Ok(event) => printer.on_event(&engine, event),
        Err(RecvError::Lagged(skipped)) => {
          debug!(skipped, "event printer lagged");
          printer.messages(&engine);
          printer.notifications(&engine);
        }
        Err(RecvError::Closed) => break,
      }
    }
  })
}

impl Printer {
  fn on_event<S: RemoteStore + 'static>(&mut self, engine: &Engine<S>, event: EngineEvent) {
    match event {
      EngineEvent::Changed {
        slot: Slot::ActiveMessages,
        ..
      } => self.messages(engine),
      EngineEvent::Changed {
        slot: Slot::ActiveTyping,
        ..
      } => self.typing(engine),
      EngineEvent::Changed {
        slot: Slot::Notifications,
        ..
      } => self.notifications(engine),
      EngineEvent::Changed { .. } => {}
      EngineEvent::SubscriptionFailed { slot, error } => {
        eprintln!("! {slot} subscription failed: {error}");
      }
      EngineEvent::Cleared { .. } => *self = Self::default(),
    }
  }

  fn messages<S: RemoteStore + 'static>(&mut self, engine: &Engine<S>) {
    let (Some(active), Some(identity)) = (engine.active(), engine.identity()) else {
      return;
    };
    if self.conversation.as_ref() != Some(&active) {
      self.conversation = Some(active.clone());
      self.messages.clear();
      self.typing = None;
    }

    let lines = engine.read(|snap| {
      view::chat_messages(snap, &active)
        .into_iter()
        .filter(|m| self.messages.insert(m.id.clone()))
        .map(|m| {
          let label = snap
            .conversation(&active)
            .and_then(|c| view::delivery_label(m, &c, &identity.uid));
          render_message(&view::user_label(snap, &m.sender_id), m, label)
        })
        .collect::<Vec<_>>()
    });
    for line in lines {
      println!("{line}");
    }
  }

  fn typing<S: RemoteStore + 'static>(&mut self, engine: &Engine<S>) {
    let line = view::typing_line(&engine.typing_users());
    if line != self.typing {
      if let Some(line) = &line {
        println!("  {line}");
      }
      self.typing = line;
    }
  }

  fn notifications<S: RemoteStore + 'static>(&mut self, engine: &Engine<S>) {
    let fresh = engine.read(|snap| {
      snap
        .notifications()
        .filter(|n| !n.read && self.notifications.insert(n.id.clone()))
        .map(|n| n.text.clone())
        .collect::<Vec<_>>()
    });
    for text in fresh {
      println!("* {text}");
    }
  }
}
