//! Successful-SSH inference
//!
//! An SSH event signals success either explicitly (the parser flagged the
//! authentication) or implicitly (the session moved more bytes than a failed
//! handshake could). Both paths need the original connection flow, which may
//! not have reached the store yet; in that case the full check is re-run
//! once after the defer window.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::scheduler::TaskKey;
use crate::types::{DetectionTarget, Evidence, EvidenceKind, FlowRecord, SshFlow, SshModel};

use super::FlowAlerts;

const SSH_DETECTOR: &str = "ssh-successful";

impl FlowAlerts {
    /// Run the SSH-channel check for one event.
    pub async fn handle_ssh(&self, rec: &FlowRecord, ssh: &SshFlow) {
        if let Err(e) = self
            .check_ssh(
                &rec.profile_id,
                &rec.twid,
                &rec.uid,
                rec.timestamp,
                ssh.auth_success,
                false,
            )
            .await
        {
            self.note_failure("ssh-successful", &e);
        }
    }

    /// Full check, shared by the first pass and the re-check pass. When the
    /// original flow is absent on the first pass, the entire check is
    /// deferred once; the re-check gives up quietly if it is still missing.
    fn check_ssh<'a>(
        &'a self,
        profile_id: &'a str,
        twid: &'a str,
        uid: &'a str,
        timestamp: f64,
        auth_success: bool,
        is_recheck: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let Some(flow) = self.store.get_flow(profile_id, twid, uid).await else {
            if is_recheck {
                // one-shot exhausted; resolve the key so the set stays bounded
                self.pending_ssh.clear(uid);
                return Ok(());
            }
            if self.pending_ssh.mark(uid) {
                let Some(me) = self.weak.upgrade() else {
                    self.pending_ssh.clear(uid);
                    return Ok(());
                };
                let profile_id = profile_id.to_string();
                let twid = twid.to_string();
                let uid_owned = uid.to_string();
                self.scheduler.schedule(
                    TaskKey::new(SSH_DETECTOR, uid),
                    self.recheck_delay(),
                    Box::pin(async move {
                        if let Err(e) = me
                            .check_ssh(&profile_id, &twid, &uid_owned, timestamp, auth_success, true)
                            .await
                        {
                            me.note_failure("ssh-successful", &e);
                        }
                    }),
                );
            }
            return Ok(());
        };

        let model = if auth_success {
            Some(SshModel::AuthFlag)
        } else if flow.allbytes > self.config.ssh_successful_detection_threshold {
            Some(SshModel::ByteThreshold)
        } else {
            None
        };

        if let Some(model) = model {
            let ident = self.store.get_ip_identification(&flow.daddr).await;
            // informational rather than a detection; threat level reflects that
            let evidence = Evidence::new(
                EvidenceKind::SshSuccessful(model),
                DetectionTarget::SrcIp,
                &flow.saddr,
                0.0,
                0.5,
            )
            .describe(format!(
                "SSH successful to IP {}. {}. From IP {}. Size: {}. Detection model {}",
                flow.daddr,
                ident,
                flow.saddr,
                flow.allbytes,
                model.as_str()
            ))
            .tagged(profile_id, twid, uid, timestamp);
            self.emit(evidence).await;
        }
        self.pending_ssh.clear(uid);
        Ok(())
        })
    }
}
