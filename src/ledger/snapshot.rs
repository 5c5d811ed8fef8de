use crate::limits::Window;
use serde::Serialize;
use std::ops::AddAssign;

/// 某一时刻的用量视图：各窗口内（已结算 + 预留中）的请求与 token，以及累计值。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub rpm: u64,
    pub rph: u64,
    pub rpd: u64,
    pub tpm: u64,
    pub tph: u64,
    pub tpd: u64,
    pub total_requests: u64,
    pub total_tokens: u64,
}

impl UsageSnapshot {
    pub fn requests(&self, w: Window) -> u64 {
        match w {
            Window::Minute => self.rpm,
            Window::Hour => self.rph,
            Window::Day => self.rpd,
        }
    }

    pub fn tokens(&self, w: Window) -> u64 {
        match w {
            Window::Minute => self.tpm,
            Window::Hour => self.tph,
            Window::Day => self.tpd,
        }
    }

    pub(crate) fn add_window(&mut self, w: Window, requests: u64, tokens: u64) {
        let (r, t) = match w {
            Window::Minute => (&mut self.rpm, &mut self.tpm),
            Window::Hour => (&mut self.rph, &mut self.tph),
            Window::Day => (&mut self.rpd, &mut self.tpd),
        };
        *r = r.saturating_add(requests);
        *t = t.saturating_add(tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.total_requests == 0 && self.total_tokens == 0
    }
}

impl AddAssign for UsageSnapshot {
    fn add_assign(&mut self, o: Self) {
        for w in Window::ALL {
            self.add_window(w, o.requests(w), o.tokens(w));
        }
        self.total_requests = self.total_requests.saturating_add(o.total_requests);
        self.total_tokens = self.total_tokens.saturating_add(o.total_tokens);
    }
}
