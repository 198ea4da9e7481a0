//! Console commands and their dispatch onto the engine.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use base64::Engine as _;
use chrono::{DateTime, Local, Utc};
use parley_core::{
  conversation::{Conversation, ConversationRef},
  message::{Draft, Message},
  store::RemoteStore,
  view,
};
use parley_engine::Engine;

pub const HELP: &str = "\
commands:
  /chats [filter]          list conversations (numbered for /open)
  /open <n|kind:id>        open a conversation
  /close                   close the active conversation
  /dm <user-id>            open (or create) a direct chat
  /group <name> [ids...]   create a group
  /toggle <group> <user>   add or remove a group member
  /leave <group>           leave a group
  /users [filter]          search the directory
  /groups [filter]         search your groups
  /members                 members of the active group
  /show                    print the active conversation
  /media                   recent images and videos
  /seen                    mark the active conversation seen
  /refresh                 reload the active conversation once
  /del <message-id>        delete one of your messages
  /typing                  signal typing in the active conversation
  /attach <file>           send an image or video
  /notes                   list notifications
  /read [id]               toggle one notification, or mark all read
  /name <display name>     change your display name
  /export <file>           write your data as JSON
  /quit
anything else is sent to the active conversation";

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  Chats(String),
  Open(String),
  Close,
  Direct(String),
  Group { name: String, members: Vec<String> },
  Toggle { group: String, user: String },
  Leave(String),
  Users(String),
  Groups(String),
  Members,
  Show,
  Media,
  Seen,
  Refresh,
  Delete(String),
  Typing,
  Attach(PathBuf),
  Notes,
  Read(Option<String>),
  Name(String),
  Export(PathBuf),
  Help,
  Quit,
  Say(String),
}

impl Command {
  /// Parse one input line. Blank lines yield `None`.
  pub fn parse(line: &str) -> Result<Option<Self>> {
    let line = line.trim();
    if line.is_empty() {
      return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
      return Ok(Some(Self::Say(line.to_owned())));
    };

    let (verb, arg) = match rest.split_once(char::is_whitespace) {
      Some((verb, arg)) => (verb, arg.trim()),
      None => (rest, ""),
    };
    let required = |what: &str| -> Result<String> {
      if arg.is_empty() {
        bail!("/{verb} needs {what}");
      }
      Ok(arg.to_owned())
    };

    let command = match verb {
      "chats" => Self::Chats(arg.to_owned()),
      "open" => Self::Open(required("a conversation")?),
      "close" => Self::Close,
      "dm" => Self::Direct(required("a user id")?),
      "group" => {
        let mut words = required("a name")?
          .split_whitespace()
          .map(str::to_owned)
          .collect::<Vec<_>>();
        let name = words.remove(0);
        Self::Group {
          name,
          members: words,
        }
      }
      "toggle" => match arg.split_whitespace().collect::<Vec<_>>()[..] {
        [group, user] => Self::Toggle {
          group: group.to_owned(),
          user:  user.to_owned(),
        },
        _ => bail!("usage: /toggle <group> <user>"),
      },
      "leave" => Self::Leave(required("a group id")?),
      "users" => Self::Users(arg.to_owned()),
      "groups" => Self::Groups(arg.to_owned()),
      "members" => Self::Members,
      "show" => Self::Show,
      "media" => Self::Media,
      "seen" => Self::Seen,
      "refresh" => Self::Refresh,
      "del" => Self::Delete(required("a message id")?),
      "typing" => Self::Typing,
      "attach" => Self::Attach(PathBuf::from(required("a file")?)),
      "notes" => Self::Notes,
      "read" => Self::Read((!arg.is_empty()).then(|| arg.to_owned())),
      "name" => Self::Name(required("a name")?),
      "export" => Self::Export(PathBuf::from(required("a file")?)),
      "help" | "?" => Self::Help,
      "quit" | "q" | "exit" => Self::Quit,
      other => bail!("unknown command /{other} (try /help)"),
    };
    Ok(Some(command))
  }
}

// ─── App ─────────────────────────────────────────────────────────────────────

pub struct App<S> {
  engine: Engine<S>,
  /// Conversations from the last `/chats`, addressable by position.
  listed: Vec<ConversationRef>,
}

impl<S: RemoteStore + 'static> App<S> {
  pub fn new(engine: Engine<S>) -> Self {
    Self {
      engine,
      listed: vec![],
    }
  }

  /// Run one command. Returns `false` when the user asked to quit.
  pub async fn handle(&mut self, command: Command) -> Result<bool> {
    let engine = &self.engine;
    match command {
      Command::Chats(filter) => {
        let rows = engine.conversations(&filter);
        if rows.is_empty() {
          println!("no conversations");
        }
        for (n, row) in rows.iter().enumerate() {
          let unread = match row.unread {
            0 => String::new(),
            n => format!(" ({n} unread)"),
          };
          let presence = match &row.presence {
            Some(p) if p.online => " [online]".to_owned(),
            Some(p) => p
              .last_seen_at
              .map(|at| format!(" [last seen {}]", clock(at)))
              .unwrap_or_default(),
            None => String::new(),
          };
          println!("{:>3}. {}{unread}{presence}  {}", n + 1, row.label, row.reference);
        }
        self.listed = rows.into_iter().map(|row| row.reference).collect();
      }
      Command::Open(target) => {
        let reference = self.resolve(&target)?;
        engine.open_conversation(reference.clone()).await?;
        println!("-- {} --", self.label(&reference));
      }
      Command::Close => engine.close_conversation().await,
      Command::Direct(peer) => {
        let reference = engine.create_direct(&peer).await?;
        engine.open_conversation(reference).await?;
      }
      Command::Group { name, members } => {
        let reference = engine.create_group(&name, &members).await?;
        println!("created group {name} ({reference})");
      }
      Command::Toggle { group, user } => {
        let change = engine.toggle_group_membership(&group, &user).await?;
        println!("{user}: {change}");
      }
      Command::Leave(group) => engine.leave_group(&group).await?,
      Command::Users(filter) => {
        let uid = self.uid()?;
        engine.read(|snap| {
          for user in view::directory(snap, &uid, &filter) {
            let status = if user.online { "online" } else { "offline" };
            let name = user.label().unwrap_or(view::UNKNOWN_USER);
            println!("  {:<16} {name} ({status})", user.id);
          }
        });
      }
      Command::Groups(filter) => engine.read(|snap| {
        for group in view::groups_matching(snap, &filter) {
          println!("  {:<24} {} ({} members)", group.id, group.name, group.members.len());
        }
      }),
      Command::Members => {
        let active = self.active()?;
        engine.read(|snap| match snap.conversation(&active) {
          Some(Conversation::Group(group)) => {
            for (id, label) in group.members.iter().zip(view::member_labels(snap, &group)) {
              let owner = if group.is_owner(id) { " (owner)" } else { "" };
              println!("  {label}{owner}");
            }
          }
          _ => println!("the active conversation is not a group"),
        });
      }
      Command::Show => {
        let active = self.active()?;
        let uid = self.uid()?;
        engine.read(|snap| {
          let conversation = snap.conversation(&active);
          for message in view::chat_messages(snap, &active) {
            let label = conversation
              .as_ref()
              .and_then(|c| view::delivery_label(message, c, &uid));
            println!("{}", render_message(&view::user_label(snap, &message.sender_id), message, label));
          }
        });
      }
      Command::Media => {
        let active = self.active()?;
        let window = engine.config().media_window;
        engine.read(|snap| {
          for message in view::media_gallery(snap, &active, window) {
            let size = message.payload.len();
            println!("  {} {} ({size} bytes)", message.id, message.kind);
          }
        });
      }
      Command::Seen => {
        let updated = engine.mark_seen(&self.active()?).await?;
        println!("marked {updated} seen");
      }
      Command::Refresh => {
        let loaded = engine.refresh(&self.active()?).await?;
        println!("loaded {loaded} messages");
      }
      Command::Delete(id) => engine.delete_message(&id).await?,
      Command::Typing => engine.input_activity().await?,
      Command::Attach(path) => {
        let draft = attachment_draft(&path).await?;
        engine.send_message(&self.active()?, draft).await?;
      }
      Command::Notes => engine.read(|snap| {
        for note in snap.notifications() {
          let mark = if note.read { ' ' } else { '*' };
          println!("{mark} {:<24} {}", note.id, note.text);
        }
      }),
      Command::Read(Some(id)) => {
        let read = engine.toggle_notification_read(&id).await?;
        println!("{id}: {}", if read { "read" } else { "unread" });
      }
      Command::Read(None) => {
        let updated = engine.mark_all_notifications_read().await?;
        println!("marked {updated} read");
      }
      Command::Name(name) => engine.update_display_name(&name).await?,
      Command::Export(path) => {
        let bundle = engine.export().await?;
        let json = serde_json::to_string_pretty(&bundle)?;
        tokio::fs::write(&path, json)
          .await
          .with_context(|| format!("failed to write {}", path.display()))?;
        println!("exported {} messages to {}", bundle.messages.len(), path.display());
      }
      Command::Help => println!("{HELP}"),
      Command::Quit => return Ok(false),
      Command::Say(text) => {
        engine.send_message(&self.active()?, Draft::text(text)).await?;
      }
    }
    Ok(true)
  }

  /// A position from the last `/chats`, or a `kind:id` reference.
  fn resolve(&self, target: &str) -> Result<ConversationRef> {
    if let Ok(n) = target.parse::<usize>() {
      return n
        .checked_sub(1)
        .and_then(|i| self.listed.get(i))
        .cloned()
        .with_context(|| format!("no conversation #{n} (run /chats)"));
    }
    Ok(target.parse::<ConversationRef>()?)
  }

  fn active(&self) -> Result<ConversationRef> {
    self
      .engine
      .active()
      .context("no active conversation (use /open or /dm)")
  }

  fn uid(&self) -> Result<String> {
    Ok(self.engine.identity().context("not signed in")?.uid)
  }

  fn label(&self, reference: &ConversationRef) -> String {
    let uid = self.engine.identity().map(|i| i.uid).unwrap_or_default();
    self
      .engine
      .read(|snap| view::display_label(snap, reference, &uid))
  }
}

// ─── Rendering ───────────────────────────────────────────────────────────────

fn clock(at: DateTime<Utc>) -> String { at.with_timezone(&Local).format("%H:%M").to_string() }

/// One line per message: time, sender, body and (for own messages) the
/// delivery label.
pub fn render_message(
  sender: &str,
  message: &Message,
  label: Option<view::DeliveryLabel>,
) -> String {
  let at = message.created_at.map(clock).unwrap_or_else(|| "--:--".into());
  let body = if message.deleted {
    "(deleted)".to_owned()
  } else if message.kind.is_media() {
    format!("[{}]", message.kind)
  } else {
    message.payload.clone()
  };
  match label {
    Some(label) => format!("[{at}] {sender}: {body}  ({label})"),
    None => format!("[{at}] {sender}: {body}"),
  }
}

/// Read an image or video file into a data-URL attachment.
async fn attachment_draft(path: &Path) -> Result<Draft> {
  let media_type = media_type_for(path)
    .with_context(|| format!("{} is not a supported image or video", path.display()))?;
  let bytes = tokio::fs::read(path)
    .await
    .with_context(|| format!("failed to read {}", path.display()))?;
  let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
  Ok(Draft::attachment(media_type, format!("data:{media_type};base64,{encoded}")))
}

fn media_type_for(path: &Path) -> Option<&'static str> {
  let extension = path.extension()?.to_str()?.to_ascii_lowercase();
  let media_type = match extension.as_str() {
    "png" => "image/png",
    "jpg" | "jpeg" => "image/jpeg",
    "gif" => "image/gif",
    "webp" => "image/webp",
    "mp4" => "video/mp4",
    "webm" => "video/webm",
    "mov" => "video/quicktime",
    _ => return None,
  };
  Some(media_type)
}
