//! tc ingress redirection between two links.
//!
//! A redirect is an `ingress` qdisc on the source link plus a match-all `u32`
//! filter whose only action is `mirred egress redirect` to the destination
//! link with `stolen` disposition:
//!
//! ```text
//! tc qdisc add dev <src> ingress
//! tc filter add dev <src> parent ffff: protocol all u32 match u8 0 0 \
//!     action mirred egress redirect dev <dst>
//! ```

use crate::error::{Context, NetopsError, Result};
use crate::ns::Ns;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Parent handle of filters attached to the ingress qdisc (`ffff:`).
const INGRESS_FILTER_PARENT: u32 = 0xffff_0000;

/// `TC_H_INGRESS`, the pseudo parent of the ingress qdisc.
const TC_H_INGRESS: u32 = 0xffff_fff1;

impl Ns {
    /// Redirect every packet received on `src` out of `dst`.
    pub async fn redirect_add(&self, src: &str, dst: &str) -> Result<()> {
        let src_link = self.link_find(src).await?;
        let dst_link = self.link_find(dst).await?;
        let describe = format!("{src} -> {dst} on {}", self.path().display());

        match self
            .handle()
            .qdisc()
            .add(src_link.index() as i32)
            .ingress()
            .execute()
            .await
        {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                debug!(link = src, "Ingress qdisc already present");
            }
            Err(e) => {
                return Err(NetopsError::from(e)
                    .context(format!("failed to add ingress qdisc for redirect {describe}")));
            }
        }

        self.handle()
            .traffic_filter(src_link.index() as i32)
            .add()
            .parent(INGRESS_FILTER_PARENT)
            .protocol((libc::ETH_P_ALL as u16).to_be())
            .redirect(dst_link.index())
            .with_context(|| format!("failed to build redirect filter {describe}"))?
            .execute()
            .await
            .with_context(|| format!("failed to add redirect filter {describe}"))?;

        info!(src, dst, ns = %self.path().display(), "Redirect added");
        Ok(())
    }

    /// Remove all `u32` filters and the ingress qdisc from `src`.
    ///
    /// Missing filters or qdisc are not an error.
    pub async fn redirect_del(&self, src: &str) -> Result<()> {
        let src_link = self.link_find(src).await?;
        let index = src_link.index() as i32;
        let describe = format!("{src} on {}", self.path().display());

        let mut request = TcMessage::default();
        request.header.index = index;
        request.header.parent = TcHandle::from(INGRESS_FILTER_PARENT);

        let replies = self
            .nl_dump(RouteNetlinkMessage::GetTrafficFilter(request))
            .await
            .with_context(|| format!("failed to list filters of {describe}"))?;

        // One delete per priority removes every u32 node under it
        let priorities: BTreeSet<u32> = replies
            .iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewTrafficFilter(message)
                    if message.header.index == index && has_kind(message, "u32") =>
                {
                    Some(message.header.info)
                }
                _ => None,
            })
            .collect();

        for info in priorities {
            let mut message = TcMessage::default();
            message.header.index = index;
            message.header.parent = TcHandle::from(INGRESS_FILTER_PARENT);
            message.header.info = info;
            message.attributes.push(TcAttribute::Kind("u32".to_string()));

            match self
                .nl_ack(RouteNetlinkMessage::DelTrafficFilter(message))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(e.context(format!("failed to delete u32 filter of {describe}")));
                }
            }
        }

        let mut message = TcMessage::default();
        message.header.index = index;
        message.header.parent = TcHandle::from(TC_H_INGRESS);
        message.header.handle = TcHandle::from(INGRESS_FILTER_PARENT);
        message
            .attributes
            .push(TcAttribute::Kind("ingress".to_string()));

        match self
            .nl_ack(RouteNetlinkMessage::DelQueueDiscipline(message))
            .await
        {
            Ok(()) => {}
            // The kernel answers EINVAL when there is no ingress qdisc
            Err(e) if e.is_not_found() || e.kind() == crate::ErrorKind::Invalid => {
                debug!(link = src, "No ingress qdisc to delete");
            }
            Err(e) => {
                return Err(e.context(format!("failed to delete ingress qdisc of {describe}")));
            }
        }

        info!(src, ns = %self.path().display(), "Redirect deleted");
        Ok(())
    }

    /// Kinds of the qdiscs attached to `link` (`ingress`, `noqueue`, ...).
    pub async fn qdisc_kinds(&self, link: &str) -> Result<Vec<String>> {
        let index = self.link_find(link).await?.index() as i32;

        let replies = self
            .nl_dump(RouteNetlinkMessage::GetQueueDiscipline(TcMessage::default()))
            .await
            .with_context(|| format!("failed to list qdiscs on {}", self.path().display()))?;

        Ok(replies
            .iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewQueueDiscipline(message)
                    if message.header.index == index =>
                {
                    message.attributes.iter().find_map(|attr| match attr {
                        TcAttribute::Kind(kind) => Some(kind.clone()),
                        _ => None,
                    })
                }
                _ => None,
            })
            .collect())
    }
}

fn has_kind(message: &TcMessage, kind: &str) -> bool {
    message
        .attributes
        .iter()
        .any(|attr| matches!(attr, TcAttribute::Kind(k) if k == kind))
}
