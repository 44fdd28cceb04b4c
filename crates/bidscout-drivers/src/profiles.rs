//! Static per-portal profiles: capability, listing order guarantees and page selectors.

use bidscout_core::ListingOrder;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SingleAgency,
    /// Several cities behind one portal; results carry per-city subtotals.
    MultiAgency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSelectors {
    pub row: &'static str,
    pub title: &'static str,
    pub link: &'static str,
    pub posted: Option<&'static str>,
    pub due: Option<&'static str>,
    pub agency: Option<&'static str>,
    pub next_page: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailSelectors {
    pub title: &'static str,
    pub description: Option<&'static str>,
    pub posted: Option<&'static str>,
    pub due: Option<&'static str>,
    pub contact_name: Option<&'static str>,
    pub contact_email: Option<&'static str>,
    pub contact_phone: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalProfile {
    pub portal_id: &'static str,
    pub display_name: &'static str,
    pub capability: Capability,
    pub order: ListingOrder,
    /// Detail pages share one session; fetch them one at a time.
    pub session_affinity: bool,
    /// Text that only appears on the portal's sign-in page.
    pub login_marker: Option<&'static str>,
    pub listing: ListingSelectors,
    /// `None` when the listing row carries every field.
    pub detail: Option<DetailSelectors>,
}

impl PortalProfile {
    pub fn is_multi_agency(&self) -> bool {
        self.capability == Capability::MultiAgency
    }
}

pub const PLANETBIDS: PortalProfile = PortalProfile {
    portal_id: "planetbids",
    display_name: "PlanetBids",
    capability: Capability::MultiAgency,
    order: ListingOrder::PostedDescending,
    session_affinity: true,
    login_marker: None,
    listing: ListingSelectors {
        row: "table.pb-datatable tbody tr",
        title: "td.title",
        link: "td.title a",
        posted: Some("td.stage-posted"),
        due: Some("td.stage-due"),
        agency: None,
        next_page: Some("a.pb-next[href]"),
    },
    detail: Some(DetailSelectors {
        title: "h1.bid-title",
        description: Some("div.scope-of-services"),
        posted: Some("span.bid-posted"),
        due: Some("span.bid-due"),
        contact_name: Some("div.bid-contact .name"),
        contact_email: Some("div.bid-contact a[href^=\"mailto:\"]"),
        contact_phone: Some("div.bid-contact .phone"),
    }),
};

pub const OPENGOV: PortalProfile = PortalProfile {
    portal_id: "opengov",
    display_name: "OpenGov Procurement",
    capability: Capability::MultiAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "div.project-list-item",
        title: "a.project-title",
        link: "a.project-title",
        posted: Some("span.release-date"),
        due: Some("span.proposal-deadline"),
        agency: None,
        next_page: Some("li.next a[href]"),
    },
    detail: Some(DetailSelectors {
        title: "h1.project-title",
        description: Some("div.project-summary"),
        posted: Some("dd.release-date"),
        due: Some("dd.proposal-deadline"),
        contact_name: Some("div.procurement-contact .name"),
        contact_email: Some("div.procurement-contact a[href^=\"mailto:\"]"),
        contact_phone: Some("div.procurement-contact .phone"),
    }),
};

pub const QUESTCDN: PortalProfile = PortalProfile {
    portal_id: "questcdn",
    display_name: "QuestCDN",
    capability: Capability::MultiAgency,
    order: ListingOrder::PostedDescending,
    session_affinity: true,
    login_marker: None,
    listing: ListingSelectors {
        row: "table#posting-table tbody tr",
        title: "td.posting-name",
        link: "td.posting-name a",
        posted: Some("td.posting-date"),
        due: Some("td.bid-date"),
        agency: Some("td.owner"),
        next_page: Some("a.paginate_button.next[href]"),
    },
    detail: Some(DetailSelectors {
        title: "h2.project-name",
        description: Some("div.project-description"),
        posted: None,
        due: Some("td.closing-date"),
        contact_name: None,
        contact_email: None,
        contact_phone: None,
    }),
};

pub const BIDNET: PortalProfile = PortalProfile {
    portal_id: "bidnet",
    display_name: "BidNet Direct",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: true,
    login_marker: Some("saml/login"),
    listing: ListingSelectors {
        row: "tr.mets-table-row",
        title: "a.solicitation-link",
        link: "a.solicitation-link",
        posted: Some("td.publication-date"),
        due: Some("td.closing-date"),
        agency: None,
        next_page: Some("a.mets-pagination-next[href]"),
    },
    detail: Some(DetailSelectors {
        title: "h1.solicitation-title",
        description: Some("div.solicitation-description"),
        posted: Some("span.publication-date"),
        due: Some("span.closing-date"),
        contact_name: Some("div.buyer-contact .name"),
        contact_email: Some("div.buyer-contact a[href^=\"mailto:\"]"),
        contact_phone: Some("div.buyer-contact .phone"),
    }),
};

pub const ARTESIA: PortalProfile = PortalProfile {
    portal_id: "artesia",
    display_name: "City of Artesia",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "div.listItemsRow.bid",
        title: "div.bidTitle a",
        link: "div.bidTitle a",
        posted: Some("div.bidStatus span.published"),
        due: Some("div.bidStatus span.closes"),
        agency: None,
        next_page: None,
    },
    detail: Some(DetailSelectors {
        title: "h2.bidTitle",
        description: Some("div.bidDescription"),
        posted: None,
        due: None,
        contact_name: Some("div.bidContact .name"),
        contact_email: Some("div.bidContact a[href^=\"mailto:\"]"),
        contact_phone: Some("div.bidContact .phone"),
    }),
};

pub const COMPTON: PortalProfile = PortalProfile {
    portal_id: "compton",
    display_name: "City of Compton",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "table.rfp-table tbody tr",
        title: "td:nth-child(1)",
        link: "td:nth-child(1) a",
        posted: Some("td:nth-child(2)"),
        due: Some("td:nth-child(3)"),
        agency: None,
        next_page: None,
    },
    detail: None,
};

pub const BELL_GARDENS: PortalProfile = PortalProfile {
    portal_id: "bell-gardens",
    display_name: "City of Bell Gardens",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "div.bid-item",
        title: "h3 a",
        link: "h3 a",
        posted: Some("span.posted"),
        due: Some("span.due"),
        agency: None,
        next_page: None,
    },
    detail: None,
};

pub const EL_SEGUNDO: PortalProfile = PortalProfile {
    portal_id: "el-segundo",
    display_name: "City of El Segundo",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "table.bids tbody tr",
        title: "td.bid-name",
        link: "td.bid-name a",
        posted: Some("td.bid-open"),
        due: Some("td.bid-close"),
        agency: None,
        next_page: Some("a.next-page[href]"),
    },
    detail: Some(DetailSelectors {
        title: "h1",
        description: Some("div.bid-body"),
        posted: None,
        due: None,
        contact_name: None,
        contact_email: Some("a[href^=\"mailto:\"]"),
        contact_phone: None,
    }),
};

pub const INGLEWOOD: PortalProfile = PortalProfile {
    portal_id: "inglewood",
    display_name: "City of Inglewood",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "div.listItemsRow.bid",
        title: "div.bidTitle a",
        link: "div.bidTitle a",
        posted: Some("div.bidStatus span.published"),
        due: Some("div.bidStatus span.closes"),
        agency: None,
        next_page: None,
    },
    detail: None,
};

pub const LOMITA: PortalProfile = PortalProfile {
    portal_id: "lomita",
    display_name: "City of Lomita",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "article.rfp",
        title: "h2.entry-title",
        link: "h2.entry-title a",
        posted: Some("time.published"),
        due: Some("p.deadline"),
        agency: None,
        next_page: Some("a.next.page-numbers[href]"),
    },
    detail: None,
};

pub const WHITTIER: PortalProfile = PortalProfile {
    portal_id: "whittier",
    display_name: "City of Whittier (E-ARC)",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: true,
    login_marker: None,
    listing: ListingSelectors {
        row: "table#projectSummary tbody tr",
        title: "td.project-name",
        link: "td.project-name a",
        posted: Some("td.issue-date"),
        due: Some("td.bid-date"),
        agency: None,
        next_page: None,
    },
    detail: None,
};

pub const ALL: &[&PortalProfile] = &[
    &PLANETBIDS,
    &OPENGOV,
    &QUESTCDN,
    &BIDNET,
    &ARTESIA,
    &COMPTON,
    &BELL_GARDENS,
    &EL_SEGUNDO,
    &INGLEWOOD,
    &LOMITA,
    &WHITTIER,
];

pub fn profile_for(portal_id: &str) -> Option<&'static PortalProfile> {
    match portal_id {
        "planetbids" => Some(&PLANETBIDS),
        "opengov" => Some(&OPENGOV),
        "questcdn" => Some(&QUESTCDN),
        "bidnet" => Some(&BIDNET),
        "artesia" => Some(&ARTESIA),
        "compton" => Some(&COMPTON),
        "bell-gardens" => Some(&BELL_GARDENS),
        "el-segundo" => Some(&EL_SEGUNDO),
        "inglewood" => Some(&INGLEWOOD),
        "lomita" => Some(&LOMITA),
        "whittier" => Some(&WHITTIER),
        _ => None,
    }
}
