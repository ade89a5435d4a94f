#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{BPF_F_NO_PREALLOC, BPF_NOEXIST, TC_ACT_PIPE},
    helpers::gen::bpf_ktime_get_tai_ns,
    macros::{classifier, map},
    maps::{HashMap, PerfEventArray},
    programs::TcContext,
};
use core::ptr;
use network_types::{
    eth::{EthHdr, EtherType},
    ip::Ipv4Hdr,
};
use overseer_common::{
    FlowEvent, FlowKey, FlowValue, DIRECTION_EGRESS, DIRECTION_INGRESS, EVENT_FAIL, EVENT_NEW,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

const MAX_FLOWS: u32 = 256;

#[map]
static STATS: HashMap<FlowKey, FlowValue> =
    HashMap::with_max_entries(MAX_FLOWS, BPF_F_NO_PREALLOC);

#[map]
static EVENTS: PerfEventArray<FlowEvent> = PerfEventArray::new(0);

#[classifier]
pub fn overseer_ingress(ctx: TcContext) -> i32 {
    account(&ctx, DIRECTION_INGRESS)
}

#[classifier]
pub fn overseer_egress(ctx: TcContext) -> i32 {
    account(&ctx, DIRECTION_EGRESS)
}

/// Charge the packet to the local host it came from (ingress) or is going
/// to (egress).
///
/// Struct writes are done field-by-field to avoid compiler-generated
/// `memcpy` / `memset` calls. Those builtins land in the `.text` ELF section,
/// creating cross-section relocations that aya 0.13.x cannot resolve for
/// `classifier` sections (the verifier then sees 0 instructions).
#[inline(always)]
fn account(ctx: &TcContext, direction: u32) -> i32 {
    // -- Ethernet ----------------------------------------------------------
    let data = ctx.data();
    let data_end = ctx.data_end();

    let eth_end = data + EthHdr::LEN;
    if eth_end > data_end {
        return TC_ACT_PIPE;
    }
    let eth_hdr = data as *const EthHdr;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth_hdr).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        return TC_ACT_PIPE;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip_end = eth_end + Ipv4Hdr::LEN;
    if ip_end > data_end {
        return TC_ACT_PIPE;
    }
    let ip_hdr = eth_end as *const Ipv4Hdr;

    let mut key = FlowKey::default();
    unsafe {
        if direction == DIRECTION_INGRESS {
            key.addr = ptr::read_unaligned(ptr::addr_of!((*ip_hdr).src_addr)).to_ne_bytes();
            key.mac = ptr::read_unaligned(ptr::addr_of!((*eth_hdr).src_addr));
        } else {
            key.addr = ptr::read_unaligned(ptr::addr_of!((*ip_hdr).dst_addr)).to_ne_bytes();
            key.mac = ptr::read_unaligned(ptr::addr_of!((*eth_hdr).dst_addr));
        }
    }
    key.ifindex = unsafe { (*ctx.skb.skb).ifindex };
    key.direction = direction;

    let len = ctx.len() as u64;
    let now = unsafe { bpf_ktime_get_tai_ns() };

    // -- Update ------------------------------------------------------------
    if let Some(value) = STATS.get_ptr_mut(&key) {
        unsafe {
            (*value).packets += 1;
            (*value).bytes += len;
            (*value).last_seen_ns = now;
        }
        return TC_ACT_PIPE;
    }

    let mut value = FlowValue::default();
    value.packets = 1;
    value.bytes = len;
    value.last_seen_ns = now;

    let mut event = FlowEvent::default();
    event.key = key;
    event.kind = match STATS.insert(&key, &value, BPF_NOEXIST as u64) {
        Ok(()) => EVENT_NEW,
        Err(_) => EVENT_FAIL,
    };
    EVENTS.output(ctx, &event, 0);

    TC_ACT_PIPE
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
