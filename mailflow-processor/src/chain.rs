//! A named, ordered list of (matcher, mailet) stages
//!
//! Each stage splits the mail it is given along the recipients its matcher
//! selects:
//!
//! - nothing matched: the mail moves on to the next stage untouched
//! - everything matched: the mailet runs on the mail itself
//! - some matched: the matched recipients are forked off into a new mail for
//!   the mailet, and the rest move on to the next stage
//!
//! Every recipient present on entry lives in exactly one branch until that
//! branch is ghosted or loses its last recipient.

use std::{collections::VecDeque, sync::Arc};

use mailflow_common::{Mail, routing, state, tracing};

use crate::{
    config::{Fallthrough, ProcessorConfig},
    error::ConfigError,
    factory::Factory,
    mailet::{Mailet, MailetContext, MailetParams},
    matcher::Matcher,
};

#[derive(Debug, Clone)]
pub struct Stage {
    matcher: Arc<dyn Matcher>,
    mailet: Arc<dyn Mailet>,
}

impl Stage {
    #[must_use]
    pub fn new(matcher: Arc<dyn Matcher>, mailet: Arc<dyn Mailet>) -> Self {
        Self { matcher, mailet }
    }

    #[must_use]
    pub fn matcher(&self) -> &dyn Matcher {
        self.matcher.as_ref()
    }

    #[must_use]
    pub fn mailet(&self) -> &dyn Mailet {
        self.mailet.as_ref()
    }
}

#[derive(Debug)]
pub struct ProcessorChain {
    name: String,
    stages: Vec<Stage>,
    fallthrough: Fallthrough,
    handles_errors: bool,
}

/// Where a branch goes after a stage
enum Next {
    Continue(Mail),
    Leave(Mail),
    Done,
}

impl ProcessorChain {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            fallthrough: Fallthrough::default(),
            handles_errors: false,
        }
    }

    #[must_use]
    pub fn with_stage(mut self, matcher: Arc<dyn Matcher>, mailet: Arc<dyn Mailet>) -> Self {
        self.stages.push(Stage::new(matcher, mailet));
        self
    }

    #[must_use]
    pub fn with_fallthrough(mut self, fallthrough: Fallthrough) -> Self {
        self.fallthrough = fallthrough;
        self
    }

    /// Build a chain from configuration
    ///
    /// # Errors
    /// If any matcher expression or mailet cannot be built
    pub fn from_config(config: &ProcessorConfig, factory: &Factory) -> Result<Self, ConfigError> {
        let mut chain = Self::new(&config.name).with_fallthrough(config.fallthrough.clone());

        for stage in &config.stages {
            let matcher = factory.build_matcher(&stage.matcher)?;
            let params = MailetParams::new(&stage.mailet, stage.params.clone());
            let mailet = factory.build_mailet(&stage.mailet, &params)?;
            chain.stages.push(Stage::new(matcher, mailet));
        }

        Ok(chain)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub const fn fallthrough(&self) -> &Fallthrough {
        &self.fallthrough
    }

    #[must_use]
    pub const fn handles_errors(&self) -> bool {
        self.handles_errors
    }

    /// Mark this as the chain failures are routed to
    ///
    /// Failures inside it are recorded on the mail, which then carries on with
    /// the next stage instead of being routed back here.
    pub(crate) const fn set_handles_errors(&mut self, handles_errors: bool) {
        self.handles_errors = handles_errors;
    }

    /// Run `mail` through every stage
    ///
    /// Returns the branches that left this chain for another state. Branches
    /// that were ghosted, lost all recipients, or fell off the end of a
    /// `Ghost` chain are disposed of here.
    #[tracing::instrument(level = "debug", skip_all, fields(chain = %self.name, mail_id = %mail.id()))]
    pub async fn run(&self, mail: Mail, ctx: &MailetContext) -> Vec<Mail> {
        let mut pending = VecDeque::from([(0, mail)]);
        let mut routed = Vec::new();

        while let Some((index, mut mail)) = pending.pop_front() {
            let Some(stage) = self.stages.get(index) else {
                if let Some(mail) = self.fall_through(mail) {
                    routed.push(mail);
                }
                continue;
            };

            let mut matched = match stage.matcher.match_mail(&mail) {
                Ok(matched) => matched,
                Err(err) => {
                    tracing::warn!(
                        mail_id = %mail.id(),
                        chain = %self.name,
                        matcher = %stage.matcher.name(),
                        error = %err,
                        "Matcher failed"
                    );
                    match self.fail(mail, err.to_string()) {
                        Next::Continue(mail) => pending.push_back((index + 1, mail)),
                        Next::Leave(mail) => routed.push(mail),
                        Next::Done => {}
                    }
                    continue;
                }
            };
            matched.retain(|recipient| mail.recipients().contains(recipient));

            if matched.is_empty() {
                pending.push_back((index + 1, mail));
                continue;
            }

            let target = if matched.len() == mail.recipients().len() {
                mail
            } else {
                let fork = mail.fork(matched);
                routing!(
                    level = DEBUG,
                    "Split mail {} at {} stage {}: {} forked with {} recipient(s)",
                    mail.id(),
                    self.name,
                    index,
                    fork.id(),
                    fork.recipients().len()
                );
                pending.push_back((index + 1, mail));
                fork
            };

            match self.service(stage, target, ctx).await {
                Next::Continue(mail) => pending.push_back((index + 1, mail)),
                Next::Leave(mail) => routed.push(mail),
                Next::Done => {}
            }
        }

        routed
    }

    async fn service(&self, stage: &Stage, mut mail: Mail, ctx: &MailetContext) -> Next {
        if let Err(err) = stage.mailet.service(&mut mail, ctx).await {
            tracing::warn!(
                mail_id = %mail.id(),
                chain = %self.name,
                mailet = %stage.mailet.name(),
                error = %err,
                "Mailet failed"
            );
            return self.fail(mail, format!("{}: {err}", stage.mailet.name()));
        }

        self.settle(mail)
    }

    /// Record a failure on `mail`
    fn fail(&self, mut mail: Mail, message: String) -> Next {
        mail.set_error_message(message);
        if !self.handles_errors {
            mail.set_state(state::ERROR);
        }
        self.settle(mail)
    }

    fn settle(&self, mail: Mail) -> Next {
        if mail.is_terminal() {
            mail.dispose();
            Next::Done
        } else if mail.state() == self.name {
            Next::Continue(mail)
        } else {
            routing!(
                level = DEBUG,
                "Mail {} leaves {} for state {}",
                mail.id(),
                self.name,
                mail.state()
            );
            Next::Leave(mail)
        }
    }

    fn fall_through(&self, mut mail: Mail) -> Option<Mail> {
        match &self.fallthrough {
            Fallthrough::Ghost => {
                routing!(
                    level = DEBUG,
                    "Mail {} reached the end of {} and is dropped",
                    mail.id(),
                    self.name
                );
                mail.dispose();
                return None;
            }
            Fallthrough::Error => {
                if mail.error_message().is_none() {
                    mail.set_error_message(format!("Reached the end of processor {}", self.name));
                }
                mail.set_state(state::ERROR);
            }
            Fallthrough::Processor(next) => mail.set_state(next.as_str()),
        }

        Some(mail)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use mailflow_common::{Content, MailAddress};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::{MailetError, MatcherError},
        mailet::{Null, ToProcessor},
        matcher::{All, HostIs, RecipientIs},
    };

    fn addr(s: &str) -> MailAddress {
        s.parse().unwrap()
    }

    /// Remembers the recipients of every mail it sees
    #[derive(Debug, Default)]
    struct Record {
        seen: Mutex<Vec<BTreeSet<MailAddress>>>,
    }

    #[async_trait]
    impl Mailet for Record {
        fn name(&self) -> &str {
            "Record"
        }

        async fn service(&self, mail: &mut Mail, _: &MailetContext) -> Result<(), MailetError> {
            self.seen.lock().push(mail.recipients().clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Fails;

    #[async_trait]
    impl Mailet for Fails {
        fn name(&self) -> &str {
            "Fails"
        }

        async fn service(&self, _: &mut Mail, _: &MailetContext) -> Result<(), MailetError> {
            Err(MailetError::failed("boom"))
        }
    }

    #[derive(Debug)]
    struct Broken;

    impl Matcher for Broken {
        fn name(&self) -> &str {
            "Broken"
        }

        fn match_mail(&self, _: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
            Err(MatcherError::new("Broken", "cannot evaluate"))
        }
    }

    fn mail(state: &str, recipients: &[&str]) -> Mail {
        let mut mail = Mail::new(
            Some(addr("sender@origin.test")),
            recipients.iter().map(|r| addr(r)),
            Content::from("Subject: test\r\n\r\nbody\r\n"),
        );
        mail.set_state(state);
        mail
    }

    #[tokio::test]
    async fn test_split_routes_matched_recipients() {
        let chain = ProcessorChain::new("transport").with_stage(
            Arc::new(HostIs::new(["x.com"])),
            Arc::new(ToProcessor::new("local", None)),
        );

        let original = mail("transport", &["a@x.com", "b@y.com"]);
        let id = original.id();
        let routed = chain.run(original, &MailetContext::default()).await;

        // b@y.com fell off the end of a Ghost chain
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].state(), "local");
        assert_eq!(
            routed[0].recipients(),
            &BTreeSet::from([addr("a@x.com")])
        );
        assert_ne!(routed[0].id(), id);
        assert_eq!(routed[0].content().as_bytes(), b"Subject: test\r\n\r\nbody\r\n");
    }

    #[tokio::test]
    async fn test_full_match_runs_in_place() {
        let chain = ProcessorChain::new("transport").with_stage(
            Arc::new(All),
            Arc::new(ToProcessor::new("remote", None)),
        );

        let original = mail("transport", &["a@x.com", "b@y.com"]);
        let id = original.id();
        let routed = chain.run(original, &MailetContext::default()).await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].id(), id);
        assert_eq!(routed[0].recipients().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_match_skips_stage() {
        let record = Arc::new(Record::default());
        let chain = ProcessorChain::new("transport")
            .with_stage(Arc::new(HostIs::new(["nowhere.test"])), record.clone())
            .with_fallthrough(Fallthrough::Processor("next".to_string()));

        let routed = chain
            .run(mail("transport", &["a@x.com"]), &MailetContext::default())
            .await;

        assert!(record.seen.lock().is_empty());
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].state(), "next");
    }

    #[tokio::test]
    async fn test_recipients_are_conserved_across_splits() {
        let first = Arc::new(Record::default());
        let second = Arc::new(Record::default());
        let chain = ProcessorChain::new("transport")
            .with_stage(Arc::new(HostIs::new(["x.com"])), first.clone())
            .with_stage(
                Arc::new(RecipientIs::new([addr("b@y.com"), addr("a@x.com")])),
                second.clone(),
            )
            .with_stage(
                Arc::new(RecipientIs::new([addr("c@z.com")])),
                Arc::new(ToProcessor::new("held", None)),
            )
            .with_fallthrough(Fallthrough::Processor("remote".to_string()));

        let recipients = ["a@x.com", "b@y.com", "c@z.com", "d@x.com"];
        let routed = chain
            .run(mail("transport", &recipients), &MailetContext::default())
            .await;

        assert_eq!(*first.seen.lock(), vec![BTreeSet::from([addr("a@x.com"), addr("d@x.com")])]);

        // The fork {a, d} and the remainder {b, c} each split again
        let mut seen = second.seen.lock().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![BTreeSet::from([addr("a@x.com")]), BTreeSet::from([addr("b@y.com")])]
        );

        let mut all = BTreeSet::new();
        for mail in &routed {
            for recipient in mail.recipients() {
                assert!(all.insert(recipient.clone()), "{recipient} appears twice");
            }
        }
        assert_eq!(all, recipients.iter().map(|r| addr(r)).collect());

        let held: Vec<_> = routed.iter().filter(|m| m.state() == "held").collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].recipients(), &BTreeSet::from([addr("c@z.com")]));
    }

    #[tokio::test]
    async fn test_ghost_removes_only_its_branch() {
        let chain = ProcessorChain::new("transport")
            .with_stage(Arc::new(HostIs::new(["spam.test"])), Arc::new(Null))
            .with_fallthrough(Fallthrough::Processor("remote".to_string()));

        let routed = chain
            .run(mail("transport", &["a@spam.test", "b@ok.test"]), &MailetContext::default())
            .await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].recipients(), &BTreeSet::from([addr("b@ok.test")]));
    }

    #[tokio::test]
    async fn test_mailet_failure_moves_branch_to_error() {
        let after = Arc::new(Record::default());
        let chain = ProcessorChain::new("transport")
            .with_stage(Arc::new(HostIs::new(["x.com"])), Arc::new(Fails))
            .with_stage(Arc::new(All), after.clone());

        let routed = chain
            .run(mail("transport", &["a@x.com", "b@y.com"]), &MailetContext::default())
            .await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].state(), state::ERROR);
        assert_eq!(routed[0].recipients(), &BTreeSet::from([addr("a@x.com")]));
        assert_eq!(routed[0].error_message(), Some("Fails: boom"));

        // The sibling branch was unaffected
        assert_eq!(*after.seen.lock(), vec![BTreeSet::from([addr("b@y.com")])]);
    }

    #[tokio::test]
    async fn test_matcher_failure_moves_mail_to_error() {
        let chain = ProcessorChain::new("transport")
            .with_stage(Arc::new(Broken), Arc::new(Null));

        let routed = chain
            .run(mail("transport", &["a@x.com", "b@y.com"]), &MailetContext::default())
            .await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].state(), state::ERROR);
        assert_eq!(routed[0].recipients().len(), 2);
        assert!(routed[0].error_message().unwrap().contains("cannot evaluate"));
    }

    #[tokio::test]
    async fn test_error_chain_continues_after_failure() {
        let after = Arc::new(Record::default());
        let mut chain = ProcessorChain::new("error")
            .with_stage(Arc::new(All), Arc::new(Fails))
            .with_stage(Arc::new(All), after.clone())
            .with_fallthrough(Fallthrough::Processor("held".to_string()));
        chain.set_handles_errors(true);

        let routed = chain
            .run(mail("error", &["a@x.com"]), &MailetContext::default())
            .await;

        assert_eq!(after.seen.lock().len(), 1);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].state(), "held");
        assert_eq!(routed[0].error_message(), Some("Fails: boom"));
    }

    #[tokio::test]
    async fn test_fallthrough_error() {
        let chain = ProcessorChain::new("transport").with_fallthrough(Fallthrough::Error);

        let routed = chain
            .run(mail("transport", &["a@x.com"]), &MailetContext::default())
            .await;

        assert_eq!(routed[0].state(), state::ERROR);
        assert_eq!(
            routed[0].error_message(),
            Some("Reached the end of processor transport")
        );
    }

    #[test]
    fn test_from_config() {
        let config: ProcessorConfig = ron::from_str(
            r#"(
                name: "transport",
                stages: [
                    (match: "HostIs=x.com OR SenderIsNull", mailet: "ToProcessor", params: { "processor": "local" }),
                    (match: "All", mailet: "Null"),
                ],
            )"#,
        )
        .unwrap();

        let chain = ProcessorChain::from_config(&config, &Factory::default()).unwrap();
        assert_eq!(chain.name(), "transport");
        assert_eq!(chain.stages().len(), 2);
        assert_eq!(chain.stages()[0].matcher().name(), "HostIs=x.com OR SenderIsNull");
        assert_eq!(chain.stages()[1].mailet().name(), "Null");
    }
}
