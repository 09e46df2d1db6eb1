use libc::c_int;
use nix::ioctl_write_ptr;

// http://fxr.watson.org/fxr/source/net/if_tun.h?v=NETBSD
ioctl_write_ptr!(tunslmode, b't', 87, c_int);
ioctl_write_ptr!(tunsifmode, b't', 88, c_int);
