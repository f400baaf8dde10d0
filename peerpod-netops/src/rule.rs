//! Policy routing rules.

use crate::error::{Context, NetopsError, Result};
use crate::ns::Ns;
use ipnet::Ipv4Net;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// A policy routing rule.
///
/// When used as a filter, unset fields and `table: 0` match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    pub src: Option<Ipv4Net>,
    pub iif: Option<String>,
    pub priority: Option<u32>,
    pub table: u32,
}

impl Rule {
    pub fn matches(&self, other: &Rule) -> bool {
        (self.src.is_none() || self.src == other.src)
            && (self.iif.is_none() || self.iif == other.iif)
            && (self.priority.is_none() || self.priority == other.priority)
            && (self.table == 0 || self.table == other.table)
    }

    fn to_message(&self) -> RuleMessage {
        let mut message = RuleMessage::default();
        message.header.family = AddressFamily::Inet;
        message.header.action = RuleAction::ToTable;
        message.header.table = u8::try_from(self.table).unwrap_or(0);

        if let Some(src) = self.src {
            message.header.src_len = src.prefix_len();
            message
                .attributes
                .push(RuleAttribute::Source(IpAddr::V4(src.network())));
        }
        if let Some(iif) = &self.iif {
            message.attributes.push(RuleAttribute::Iifname(iif.clone()));
        }
        if let Some(priority) = self.priority {
            message.attributes.push(RuleAttribute::Priority(priority));
        }
        if self.table > 0 {
            message.attributes.push(RuleAttribute::Table(self.table));
        }
        message
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(priority) = self.priority {
            write!(f, "{priority}: ")?;
        }
        match self.src {
            Some(src) => write!(f, "from {src}")?,
            None => f.write_str("from all")?,
        }
        if let Some(iif) = &self.iif {
            write!(f, " iif {iif}")?;
        }
        write!(f, " lookup {}", self.table)
    }
}

impl Ns {
    pub async fn rule_add(&self, rule: &Rule) -> Result<()> {
        self.nl_new(RouteNetlinkMessage::NewRule(rule.to_message()))
            .await
            .with_context(|| format!("failed to add rule \"{rule}\" on {}", self.path().display()))?;

        debug!(rule = %rule, ns = %self.path().display(), "Rule added");
        Ok(())
    }

    /// Delete the rule with exactly this key.
    pub async fn rule_del(&self, rule: &Rule) -> Result<()> {
        self.nl_ack(RouteNetlinkMessage::DelRule(rule.to_message()))
            .await
            .with_context(|| {
                format!("failed to delete rule \"{rule}\" on {}", self.path().display())
            })?;

        debug!(rule = %rule, ns = %self.path().display(), "Rule deleted");
        Ok(())
    }

    /// IPv4 rules matching `filter`, in kernel order.
    pub async fn rule_list(&self, filter: &Rule) -> Result<Vec<Rule>> {
        let mut request = RuleMessage::default();
        request.header.family = AddressFamily::Inet;

        let replies = self
            .nl_dump(RouteNetlinkMessage::GetRule(request))
            .await
            .with_context(|| format!("failed to list rules on {}", self.path().display()))?;

        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewRule(message) => parse_rule(&message),
                _ => None,
            })
            .filter(|rule| filter.matches(rule))
            .collect())
    }

    /// Lowest table id in `[min, max]` not referenced by any rule with the
    /// given input interface and priority.
    pub async fn available_table_id(
        &self,
        iif: &str,
        priority: u32,
        min: u32,
        max: u32,
    ) -> Result<u32> {
        let used: HashSet<u32> = self
            .rule_list(&Rule {
                iif: Some(iif.to_string()),
                priority: Some(priority),
                ..Default::default()
            })
            .await?
            .into_iter()
            .map(|rule| rule.table)
            .collect();

        first_free_table(&used, min, max).ok_or_else(|| {
            NetopsError::Busy(format!(
                "no available table id in [{min}, {max}] for iif {iif} priority {priority} on {}",
                self.path().display()
            ))
        })
    }
}

fn first_free_table(used: &HashSet<u32>, min: u32, max: u32) -> Option<u32> {
    (min..=max).find(|id| !used.contains(id))
}

fn parse_rule(message: &RuleMessage) -> Option<Rule> {
    if message.header.family != AddressFamily::Inet {
        return None;
    }

    let mut rule = Rule {
        table: u32::from(message.header.table),
        // The kernel omits FRA_PRIORITY for priority 0
        priority: Some(0),
        ..Default::default()
    };

    let mut src = None;
    for attr in &message.attributes {
        match attr {
            RuleAttribute::Source(IpAddr::V4(ip)) => src = Some(*ip),
            RuleAttribute::Iifname(name) => rule.iif = Some(name.clone()),
            RuleAttribute::Priority(priority) => rule.priority = Some(*priority),
            RuleAttribute::Table(table) => rule.table = *table,
            _ => {}
        }
    }

    let src_len = message.header.src_len;
    if src_len > 0 {
        rule.src = Ipv4Net::new(src.unwrap_or(Ipv4Addr::UNSPECIFIED), src_len).ok();
    }

    Some(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_free_table() {
        let used = HashSet::from([50000, 50001, 50003]);
        assert_eq!(first_free_table(&used, 50000, 59999), Some(50002));
        assert_eq!(first_free_table(&used, 50000, 50001), None);
        assert_eq!(first_free_table(&HashSet::new(), 50000, 50000), Some(50000));
    }

    #[test]
    fn test_filter_by_subset() {
        let rule = Rule {
            src: Some("10.128.0.2/32".parse().unwrap()),
            iif: Some("ppvrf1".to_string()),
            priority: Some(505),
            table: 50000,
        };

        assert!(Rule::default().matches(&rule));
        assert!(
            Rule {
                iif: Some("ppvrf1".into()),
                priority: Some(505),
                ..Default::default()
            }
            .matches(&rule)
        );
        assert!(
            !Rule {
                priority: Some(0),
                ..Default::default()
            }
            .matches(&rule)
        );
        assert!(
            !Rule {
                table: 50001,
                ..Default::default()
            }
            .matches(&rule)
        );
    }

    #[test]
    fn test_message_round_trip() {
        let rule = Rule {
            src: Some("10.128.0.2/32".parse().unwrap()),
            iif: Some("ppvrf1".to_string()),
            priority: Some(505),
            table: 50000,
        };
        assert_eq!(parse_rule(&rule.to_message()), Some(rule));
    }

    #[test]
    fn test_parse_local_rule() {
        let mut message = RuleMessage::default();
        message.header.family = AddressFamily::Inet;
        message.header.table = 255;

        let rule = parse_rule(&message).unwrap();
        assert_eq!(rule.priority, Some(0));
        assert_eq!(rule.table, 255);
        assert!(rule.src.is_none());
    }

    #[test]
    fn test_display() {
        let rule = Rule {
            src: Some("10.128.0.2/32".parse().unwrap()),
            iif: Some("ppvrf1".to_string()),
            priority: Some(505),
            table: 50000,
        };
        assert_eq!(rule.to_string(), "505: from 10.128.0.2/32 iif ppvrf1 lookup 50000");
    }
}
