//! Command dispatch and plain-message routing.
//!
//! The ladder runs in priority order: permission gate, no-argument
//! commands, target existence, then the targeted commands. Application
//! errors become chat messages back to the offender and never touch any
//! other member's state.

use tracing::{debug, info};

use super::Server;
use crate::protocol::payload::{Command, CommandKind, FileAttachRecv, Payload, ServerMsg};

/// Text-channel retrieval convention for stored attachments.
const DOWNLOAD_PREFIX: &str = "DOWNLOAD:";
/// Legacy inline file reference convention.
const FILE_PREFIX: &str = "FILE:";

const HELP_TEXT: &str = "\
List of commands:
/help - display this text.
/quit - quit the chat group.
/view-managers - view all members with manager permissions.
/list - view all members currently online.
/tell [name] [msg] - send a private message to a member.
/kick [name] - remove a member from the chat group. *
/promote [name] - give a member manager permissions. *
/demote [name] - take a member's manager permissions. *
/mute [name] - make a member unable to send messages. *
/unmute [name] - make a member able to send messages. *
* manager permissions required.";

fn system(msg: impl Into<String>) -> Payload {
    Payload::Server(ServerMsg::system(msg))
}

impl Server {
    /// Route one decoded payload received from `name`.
    pub(crate) async fn handle(&mut self, name: &str, payload: Payload) {
        match payload {
            Payload::Command(cmd) => self.execute_command(name, cmd).await,
            Payload::Msg(text) => self.handle_text(name, text).await,
            Payload::FileAttachSend { filename } => {
                self.handle_attach_announce(name, filename).await
            }
            Payload::Bytes(data) => self.handle_attach_blob(name, data),
            // server-originated kinds arriving from a client are dropped
            Payload::Server(_) | Payload::FileAttachRecv(_) => {
                debug!(name = %name, "ignoring server-only payload from client");
            }
        }
    }

    /// Route a plain text message: retrieval conventions first, then the
    /// mute gate, then broadcast with a self-tagged echo.
    async fn handle_text(&mut self, name: &str, text: String) {
        if let Some(rest) = text.strip_prefix(DOWNLOAD_PREFIX) {
            // retrieval, not speech: allowed even while muted
            self.handle_download(name, rest.trim()).await;
            return;
        }

        let muted = self.group.get(name).map(|m| m.is_muted).unwrap_or(false);
        if muted {
            self.unicast(name, &system("Error - You are muted, message was not sent."))
                .await;
            return;
        }

        let outgoing = if text.starts_with(FILE_PREFIX) {
            // legacy inline reference: substitute a server-assigned
            // descriptor before relaying
            let path = text[FILE_PREFIX.len()..].trim();
            let (descriptor, _) = self.attachments.reserve(path, name);
            format!("{FILE_PREFIX}{descriptor}")
        } else {
            text
        };

        let relayed = Payload::Server(ServerMsg::named(name, outgoing));
        self.broadcast(&relayed, &[name]).await;
        // echo under the sender's own name so its client can render it as self
        self.unicast(name, &relayed).await;
    }

    /// Serve a `DOWNLOAD:<n>` request from the attachment store.
    async fn handle_download(&mut self, name: &str, arg: &str) {
        let blob = arg
            .parse::<u32>()
            .ok()
            .and_then(|descriptor| self.attachments.get(descriptor))
            .filter(|stored| !stored.data.is_empty())
            .map(|stored| stored.data.clone());
        match blob {
            Some(data) => {
                info!(name = %name, bytes = data.len(), "attachment download");
                self.unicast(name, &Payload::Bytes(data)).await;
            }
            None => {
                self.unicast(name, &system("Error - No such attachment."))
                    .await;
            }
        }
    }

    /// An upload announcement: reserve a descriptor and notify everyone,
    /// the sender included, so every client renders the attachment.
    async fn handle_attach_announce(&mut self, name: &str, filename: String) {
        let (descriptor, id) = self.attachments.reserve(&filename, name);
        if let Some(member) = self.group.get_mut(name) {
            member.pending_upload = Some(descriptor);
        }
        info!(name = %name, filename = %filename, descriptor, "attachment announced");
        let notice = Payload::FileAttachRecv(FileAttachRecv {
            filename,
            sender: name.to_string(),
            id,
        });
        self.broadcast(&notice, &[]).await;
    }

    /// The blob following an announcement; a blob nobody announced is
    /// dropped silently.
    fn handle_attach_blob(&mut self, name: &str, data: Vec<u8>) {
        let descriptor = match self
            .group
            .get_mut(name)
            .and_then(|member| member.pending_upload.take())
        {
            Some(descriptor) => descriptor,
            None => {
                debug!(name = %name, "unexpected blob, ignoring");
                return;
            }
        };
        info!(name = %name, descriptor, bytes = data.len(), "attachment stored");
        self.attachments.fill(descriptor, data);
    }

    /// The command ladder. First match wins.
    async fn execute_command(&mut self, executor: &str, cmd: Command) {
        let is_manager = self
            .group
            .get(executor)
            .map(|m| m.is_manager)
            .unwrap_or(false);
        if !is_manager && cmd.kind.requires_manager() {
            self.unicast(executor, &system("Error - Permission denied."))
                .await;
            return;
        }

        match cmd.kind {
            CommandKind::Help => self.unicast(executor, &system(HELP_TEXT)).await,
            CommandKind::Quit => self.execute_quit(executor).await,
            CommandKind::ViewManagers => self.execute_view_managers(executor).await,
            CommandKind::List => self.execute_list(executor).await,
            CommandKind::Unknown(byte) => {
                debug!(executor = %executor, byte, "unknown command");
                self.unicast(executor, &system("Error - Invalid input, try /help."))
                    .await;
            }
            _ if !self.group.contains(&cmd.name) => {
                self.unicast(
                    executor,
                    &system(format!("Error - '{}' is not in the group.", cmd.name)),
                )
                .await;
            }
            CommandKind::Tell => self.execute_tell(executor, &cmd.name, &cmd.msg).await,
            CommandKind::Kick => self.execute_kick(&cmd.name).await,
            CommandKind::Promote => self.execute_promote(&cmd.name).await,
            CommandKind::Demote => self.execute_demote(&cmd.name).await,
            CommandKind::Mute => self.execute_mute(&cmd.name).await,
            CommandKind::Unmute => self.execute_unmute(&cmd.name).await,
        }
    }

    async fn execute_quit(&mut self, executor: &str) {
        self.broadcast(&system(format!("{executor} left the chat.")), &[])
            .await;
        if self.group.remove_by_name(executor).is_ok() {
            info!(name = %executor, members = self.group.len(), "member quit");
        }
    }

    async fn execute_view_managers(&mut self, executor: &str) {
        let managers: Vec<String> = self
            .group
            .iter()
            .filter(|m| m.is_manager)
            .map(|m| m.to_string())
            .collect();
        self.unicast(executor, &system(format!("Managers: {}", managers.join(", "))))
            .await;
    }

    async fn execute_list(&mut self, executor: &str) {
        let online: Vec<String> = self.group.iter().map(|m| m.to_string()).collect();
        self.unicast(executor, &system(format!("Online: {}", online.join(", "))))
            .await;
    }

    async fn execute_tell(&mut self, executor: &str, target: &str, msg: &str) {
        let muted = self
            .group
            .get(executor)
            .map(|m| m.is_muted)
            .unwrap_or(false);
        if muted {
            self.unicast(
                executor,
                &system("Error - You are muted, message was not sent."),
            )
            .await;
            return;
        }
        let relayed = system(format!("{executor} -> {target}: {msg}"));
        self.unicast(executor, &relayed).await;
        self.unicast(target, &relayed).await;
    }

    async fn execute_kick(&mut self, target: &str) {
        self.broadcast(
            &system(format!("{target} has been kicked from the group.")),
            &[target],
        )
        .await;
        self.unicast(target, &system("You have been kicked from the group."))
            .await;
        if self.group.remove_by_name(target).is_ok() {
            info!(name = %target, members = self.group.len(), "member kicked");
        }
    }

    async fn execute_promote(&mut self, target: &str) {
        let changing = self
            .group
            .get(target)
            .map(|m| !m.is_manager)
            .unwrap_or(false);
        if !changing {
            return; // already a manager: defined no-op, no notification
        }
        self.unicast(target, &system("You are now a manager.")).await;
        if let Some(member) = self.group.get_mut(target) {
            member.is_manager = true;
            info!(name = %target, "promoted to manager");
        }
    }

    async fn execute_demote(&mut self, target: &str) {
        let changing = self
            .group
            .get(target)
            .map(|m| m.is_manager)
            .unwrap_or(false);
        if !changing {
            return;
        }
        self.unicast(target, &system("You are no longer a manager."))
            .await;
        if let Some(member) = self.group.get_mut(target) {
            member.is_manager = false;
            info!(name = %target, "demoted");
        }
    }

    async fn execute_mute(&mut self, target: &str) {
        let changing = self
            .group
            .get(target)
            .map(|m| !m.is_muted)
            .unwrap_or(false);
        if !changing {
            return;
        }
        self.unicast(target, &system("You have been muted by a manager."))
            .await;
        if let Some(member) = self.group.get_mut(target) {
            member.is_muted = true;
            info!(name = %target, "muted");
        }
    }

    async fn execute_unmute(&mut self, target: &str) {
        let changing = self
            .group
            .get(target)
            .map(|m| m.is_muted)
            .unwrap_or(false);
        if !changing {
            return;
        }
        self.unicast(target, &system("You are no longer muted."))
            .await;
        if let Some(member) = self.group.get_mut(target) {
            member.is_muted = false;
            info!(name = %target, "unmuted");
        }
    }
}
