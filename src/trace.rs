pub fn trace_packet_send(size: usize) {
    log::trace!("packet-send size={}", size);
}

pub fn trace_packet_receive(size: usize) {
    log::trace!("packet-receive size={}", size);
}
