use limine::request::FramebufferRequest;

use crate::debug;

pub mod serial;

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Brings up the byte-oriented devices for a core.
///
/// Serial configures itself on first print. The framebuffer response is
/// optional and unused; it is only probed so a missing one shows up in the
/// boot log.
pub fn init(cpu_id: u32) {
    if cpu_id == 0 {
        match FRAMEBUFFER_REQUEST.get_response() {
            Some(response) => {
                debug!("Found {} framebuffer(s)", response.framebuffers().count());
            }
            None => debug!("No framebuffer response"),
        }
    }
}
